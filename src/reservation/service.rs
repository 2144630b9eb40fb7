//! Reservation operations
//!
//! `reserve` debits available and records the hold; `commit` resolves it to
//! a recipient (or consumes it outright); `release` restores available.
//! The status CAS is the gate for every resolution, which is what keeps a
//! concurrent expiry sweep from double-resolving a row.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ReservationConfig, WalletConfig};
use crate::core_types::{
    AccountType, BalanceState, EntryType, Points, TransactionId, new_id, now,
};
use crate::error::PointsError;
use crate::idempotency::{EventScope, IdempotencyService};
use crate::ledger::entry::CreateEntryRequest;
use crate::ledger::service::LedgerService;
use crate::reservation::{Reservation, ReservationStatus};
use crate::store::Store;
use crate::validation::{
    IdempotencyKey, MAX_IDENTIFIER_LEN, validate_identifier, validate_positive_amount,
};
use crate::wallet::models::{ModelWallet, ModelWalletType, Wallet};
use crate::wallet::occ::{OccAttempt, with_occ_retry};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReserveResult {
    pub reservation_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub transaction_id: TransactionId,
    pub new_available_balance: Points,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitResult {
    pub reservation_id: String,
    pub transaction_id: TransactionId,
    pub recipient_id: Option<String>,
    pub amount: Points,
}

pub struct ReservationService {
    store: Arc<dyn Store>,
    ledger: Arc<LedgerService>,
    idempotency: Arc<IdempotencyService>,
    wallet_config: WalletConfig,
    config: ReservationConfig,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<LedgerService>,
        idempotency: Arc<IdempotencyService>,
        wallet_config: WalletConfig,
        config: ReservationConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            idempotency,
            wallet_config,
            config,
        }
    }

    /// Hold `amount` for up to `ttl_seconds` (service default if omitted).
    pub async fn reserve(
        &self,
        user_id: &str,
        amount: i64,
        ttl_seconds: Option<u64>,
        idempotency_key: &str,
    ) -> Result<ReserveResult, PointsError> {
        let user_id = validate_identifier("user_id", user_id, MAX_IDENTIFIER_LEN)?;
        let amount = validate_positive_amount("amount", amount)?;
        let key = IdempotencyKey::new(idempotency_key)?;
        let ttl = ttl_seconds.unwrap_or(self.config.default_ttl_seconds);

        if let Some(stored) = self.replay::<ReserveResult>(&key, EventScope::Reserve).await? {
            return Ok(stored);
        }

        let wallet = self
            .mutate_wallet(&user_id, |w| w.debit(amount))
            .await?;

        let transaction_id = new_id("txn");
        let reservation = Reservation::active(
            new_id("res"),
            user_id.clone(),
            amount,
            ttl,
            transaction_id.clone(),
        );
        self.store.insert_reservation(reservation.clone()).await?;

        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: user_id.clone(),
                account_type: AccountType::User,
                amount: -(amount as i64),
                entry_type: EntryType::Debit,
                balance_state: BalanceState::Available,
                state_transition: "available->reserved".into(),
                reason: "points_reservation".into(),
                idempotency_key: key.derived("reserve"),
                request_id: reservation.reservation_id.clone(),
                balance_before: wallet.available() + amount,
                balance_after: wallet.available(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: None,
                queue_item_id: None,
                feature_type: None,
                correlation_id: Some(reservation.reservation_id.clone()),
                metadata: serde_json::json!({}),
            })
            .await?;

        let result = ReserveResult {
            reservation_id: reservation.reservation_id.clone(),
            expires_at: reservation.expires_at,
            transaction_id,
            new_available_balance: wallet.available(),
        };
        self.store_result(&key, EventScope::Reserve, &result, 201).await?;

        info!(
            user_id = %user_id,
            reservation_id = %result.reservation_id,
            amount,
            ttl,
            "points reserved"
        );
        Ok(result)
    }

    /// Resolve an active reservation. With a recipient, the amount settles
    /// to the recipient's earned balance (with a ledger entry); without
    /// one, the amount is consumed (the reserve-time debit already recorded
    /// the value leaving available).
    pub async fn commit(
        &self,
        reservation_id: &str,
        idempotency_key: &str,
        recipient_id: Option<&str>,
    ) -> Result<CommitResult, PointsError> {
        let reservation_id =
            validate_identifier("reservation_id", reservation_id, MAX_IDENTIFIER_LEN)?;
        let recipient_id = match recipient_id {
            Some(r) => Some(validate_identifier("recipient_id", r, MAX_IDENTIFIER_LEN)?),
            None => None,
        };
        let key = IdempotencyKey::new(idempotency_key)?;

        if let Some(stored) = self.replay::<CommitResult>(&key, EventScope::Commit).await? {
            return Ok(stored);
        }

        let reservation = self.load_resolvable(&reservation_id).await?;
        let transaction_id = new_id("txn");

        // the CAS is the gate against the sweeper and rival resolutions
        if !self
            .store
            .transition_reservation(
                &reservation_id,
                ReservationStatus::Committed,
                now(),
                Some(&transaction_id),
            )
            .await?
        {
            return Err(PointsError::ReservationAlreadyProcessed(reservation_id));
        }

        if let Some(ref recipient) = recipient_id {
            let model = self.credit_model(recipient, reservation.amount).await?;
            self.ledger
                .create_entry(CreateEntryRequest {
                    account_id: recipient.clone(),
                    account_type: AccountType::Model,
                    amount: reservation.amount as i64,
                    entry_type: EntryType::Credit,
                    balance_state: BalanceState::Earned,
                    state_transition: "reserved->earned".into(),
                    reason: "reservation_commit".into(),
                    idempotency_key: key.derived("commit"),
                    request_id: reservation_id.clone(),
                    balance_before: model.earned() - reservation.amount,
                    balance_after: model.earned(),
                    transaction_id: Some(transaction_id.clone()),
                    escrow_id: None,
                    queue_item_id: None,
                    feature_type: None,
                    correlation_id: Some(reservation_id.clone()),
                    metadata: serde_json::json!({}),
                })
                .await?;
        }

        let result = CommitResult {
            reservation_id: reservation_id.clone(),
            transaction_id,
            recipient_id,
            amount: reservation.amount,
        };
        self.store_result(&key, EventScope::Commit, &result, 200).await?;

        info!(reservation_id = %reservation_id, amount = reservation.amount, "reservation committed");
        Ok(result)
    }

    /// Return an active reservation to available.
    pub async fn release(
        &self,
        reservation_id: &str,
        idempotency_key: &str,
    ) -> Result<CommitResult, PointsError> {
        let reservation_id =
            validate_identifier("reservation_id", reservation_id, MAX_IDENTIFIER_LEN)?;
        let key = IdempotencyKey::new(idempotency_key)?;

        if let Some(stored) = self.replay::<CommitResult>(&key, EventScope::Release).await? {
            return Ok(stored);
        }

        let reservation = self.load_resolvable(&reservation_id).await?;
        let transaction_id = new_id("txn");

        if !self
            .store
            .transition_reservation(
                &reservation_id,
                ReservationStatus::Released,
                now(),
                Some(&transaction_id),
            )
            .await?
        {
            return Err(PointsError::ReservationAlreadyProcessed(reservation_id));
        }

        let wallet = self
            .mutate_wallet(&reservation.user_id, |w| w.credit(reservation.amount))
            .await?;

        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: reservation.user_id.clone(),
                account_type: AccountType::User,
                amount: reservation.amount as i64,
                entry_type: EntryType::Credit,
                balance_state: BalanceState::Available,
                state_transition: "reserved->available".into(),
                reason: "reservation_release".into(),
                idempotency_key: key.derived("release"),
                request_id: reservation_id.clone(),
                balance_before: wallet.available() - reservation.amount,
                balance_after: wallet.available(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: None,
                queue_item_id: None,
                feature_type: None,
                correlation_id: Some(reservation_id.clone()),
                metadata: serde_json::json!({}),
            })
            .await?;

        let result = CommitResult {
            reservation_id: reservation_id.clone(),
            transaction_id,
            recipient_id: None,
            amount: reservation.amount,
        };
        self.store_result(&key, EventScope::Release, &result, 200).await?;

        info!(reservation_id = %reservation_id, amount = reservation.amount, "reservation released");
        Ok(result)
    }

    pub async fn get(&self, reservation_id: &str) -> Result<Option<Reservation>, PointsError> {
        let reservation_id =
            validate_identifier("reservation_id", reservation_id, MAX_IDENTIFIER_LEN)?;
        self.store.get_reservation(&reservation_id).await
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Reservation>, PointsError> {
        let user_id = validate_identifier("user_id", user_id, MAX_IDENTIFIER_LEN)?;
        self.store.list_reservations(&user_id, limit).await
    }

    /// Expire one overdue reservation: CAS `active -> expired`, restore
    /// available, append the restoring entry. Used by the sweeper.
    pub(crate) async fn expire(&self, reservation: &Reservation) -> Result<bool, PointsError> {
        let transaction_id = new_id("txn");
        if !self
            .store
            .transition_reservation(
                &reservation.reservation_id,
                ReservationStatus::Expired,
                now(),
                Some(&transaction_id),
            )
            .await?
        {
            // a commit or release won the race; nothing to restore
            return Ok(false);
        }

        let wallet = self
            .mutate_wallet(&reservation.user_id, |w| w.credit(reservation.amount))
            .await?;

        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: reservation.user_id.clone(),
                account_type: AccountType::User,
                amount: reservation.amount as i64,
                entry_type: EntryType::Credit,
                balance_state: BalanceState::Available,
                state_transition: "reserved->available".into(),
                reason: "reservation_expired".into(),
                idempotency_key: format!("{}_expire", reservation.reservation_id),
                request_id: reservation.reservation_id.clone(),
                balance_before: wallet.available() - reservation.amount,
                balance_after: wallet.available(),
                transaction_id: Some(transaction_id),
                escrow_id: None,
                queue_item_id: None,
                feature_type: None,
                correlation_id: Some(reservation.reservation_id.clone()),
                metadata: serde_json::json!({}),
            })
            .await?;

        info!(
            reservation_id = %reservation.reservation_id,
            amount = reservation.amount,
            "reservation expired, balance restored"
        );
        Ok(true)
    }

    /// A reservation must exist and be resolvable: not terminal, and not
    /// past its deadline (the clock rules even before the store catches
    /// up).
    async fn load_resolvable(&self, reservation_id: &str) -> Result<Reservation, PointsError> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| PointsError::ReservationNotFound(reservation_id.to_string()))?;

        if reservation.status != ReservationStatus::Active {
            return Err(PointsError::ReservationAlreadyProcessed(
                reservation_id.to_string(),
            ));
        }
        if reservation.is_past_deadline(now()) {
            return Err(PointsError::ReservationExpired(reservation_id.to_string()));
        }
        Ok(reservation)
    }

    async fn mutate_wallet(
        &self,
        user_id: &str,
        mutate: impl Fn(&mut Wallet) -> Result<(), &'static str> + Copy,
    ) -> Result<Wallet, PointsError> {
        let store = &self.store;
        with_occ_retry(&self.wallet_config, "reservation_wallet", move || async move {
            let wallet = store
                .create_wallet_if_absent(Wallet::new(user_id.to_string()))
                .await?;
            let expected = wallet.version();

            let mut updated = wallet;
            mutate(&mut updated).map_err(|e| match e {
                "Insufficient available balance" => PointsError::InsufficientBalance,
                other => PointsError::Internal(other.to_string()),
            })?;

            if store.update_wallet_if_version(&updated, expected).await? {
                Ok(OccAttempt::Committed(updated))
            } else {
                Ok(OccAttempt::Conflict)
            }
        })
        .await
    }

    async fn credit_model(
        &self,
        model_id: &str,
        amount: Points,
    ) -> Result<ModelWallet, PointsError> {
        let store = &self.store;
        with_occ_retry(&self.wallet_config, "reservation_model", move || async move {
            let wallet = store
                .create_model_wallet_if_absent(ModelWallet::new(
                    model_id.to_string(),
                    ModelWalletType::Earnings,
                ))
                .await?;
            let expected = wallet.version();

            let mut updated = wallet;
            updated
                .credit_earned(amount)
                .map_err(|e| PointsError::Internal(e.to_string()))?;

            if store
                .update_model_wallet_if_version(&updated, expected)
                .await?
            {
                Ok(OccAttempt::Committed(updated))
            } else {
                Ok(OccAttempt::Conflict)
            }
        })
        .await
    }

    async fn replay<T: serde::de::DeserializeOwned>(
        &self,
        key: &IdempotencyKey,
        scope: EventScope,
    ) -> Result<Option<T>, PointsError> {
        let check = self.idempotency.check(key.as_str(), scope).await?;
        if !check.is_duplicate {
            return Ok(None);
        }
        match check.stored_result {
            Some(stored) => serde_json::from_value(stored)
                .map(Some)
                .map_err(|e| PointsError::Internal(format!("stored result corrupt: {e}"))),
            None => Err(PointsError::IdempotencyConflict {
                stored_result: serde_json::Value::Null,
                status_code: check.status_code.unwrap_or(409),
            }),
        }
    }

    async fn store_result<T: Serialize>(
        &self,
        key: &IdempotencyKey,
        scope: EventScope,
        result: &T,
        status_code: u16,
    ) -> Result<(), PointsError> {
        let value = serde_json::to_value(result)
            .map_err(|e| PointsError::Internal(format!("result serialization failed: {e}")))?;
        self.idempotency
            .store(key.as_str(), scope, value, status_code, None)
            .await
    }
}
