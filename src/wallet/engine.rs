//! Wallet / escrow engine
//!
//! The only writer of wallet state. Every mutation is idempotent on its
//! client key, serializes through OCC on the contended row, writes its
//! ledger entries before publishing, and publishes exactly one lifecycle
//! event.
//!
//! Ordering inside one operation: wallet commit, then ledger entries (debit
//! before credit; user leg before model leg), then idempotency record, then
//! event. Ledger writes are idempotent on their derived keys, so a replay
//! after a partial failure completes the missing legs instead of doubling
//! them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use validator::Validate;

use crate::authz::capability::{CapabilityClaims, CapabilityType, QueueAuthorizer};
use crate::config::WalletConfig;
use crate::core_types::{
    AccountType, BalanceState, EntryType, Points, TransactionId, new_id, now,
};
use crate::error::PointsError;
use crate::events::bus::EventBus;
use crate::events::{EventPayload, PointsEvent};
use crate::idempotency::{EventScope, IdempotencyService};
use crate::ingest::types::IngestEvent;
use crate::ledger::entry::{CreateEntryRequest, state_transition};
use crate::ledger::service::LedgerService;
use crate::store::{InsertOutcome, Store};
use crate::validation::{
    IdempotencyKey, MAX_IDENTIFIER_LEN, validate_identifier, validate_positive_amount,
    validate_reason,
};
use crate::wallet::escrow::{EscrowItem, EscrowStatus};
use crate::wallet::models::{ModelWallet, ModelWalletType, UserBalance, Wallet};
use crate::wallet::occ::{OccAttempt, with_occ_retry};

/// Internal event type used for ledger completion-repair (see
/// `partial_settle_escrow`).
pub const LEDGER_REPAIR_EVENT_TYPE: &str = "ledger.repair";

const EVENT_SOURCE: &str = "wallet_engine";

// ============================================================
// REQUEST / RESULT SHAPES
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HoldRequest {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 256))]
    pub reason: String,
    #[validate(length(min = 1, max = 128))]
    pub queue_item_id: String,
    #[validate(length(min = 1, max = 128))]
    pub feature_type: String,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
    #[validate(length(min = 1, max = 128))]
    pub request_id: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoldResult {
    pub transaction_id: TransactionId,
    pub escrow_id: String,
    pub previous_balance: Points,
    pub new_available_balance: Points,
    pub escrow_balance: Points,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SettleRequest {
    #[validate(length(min = 1, max = 128))]
    pub escrow_id: String,
    #[validate(length(min = 1, max = 128))]
    pub queue_item_id: String,
    #[validate(length(min = 1, max = 128))]
    pub model_id: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
    #[validate(length(min = 1, max = 128))]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettleResult {
    pub transaction_id: TransactionId,
    pub settled_amount: Points,
    pub model_earned_balance: Points,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RefundRequest {
    #[validate(length(min = 1, max = 128))]
    pub escrow_id: String,
    #[validate(length(min = 1, max = 128))]
    pub queue_item_id: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
    #[validate(length(min = 1, max = 128))]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefundResult {
    pub transaction_id: TransactionId,
    pub refunded_amount: Points,
    pub user_available_balance: Points,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PartialSettleRequest {
    #[validate(length(min = 1, max = 128))]
    pub escrow_id: String,
    #[validate(length(min = 1, max = 128))]
    pub queue_item_id: String,
    #[validate(length(min = 1, max = 128))]
    pub model_id: String,
    #[validate(range(min = 1))]
    pub refund_amount: i64,
    #[validate(range(min = 1))]
    pub settle_amount: i64,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
    #[validate(length(min = 1, max = 128))]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialSettleResult {
    pub transaction_id: TransactionId,
    pub refunded_amount: Points,
    pub settled_amount: Points,
    pub user_available_balance: Points,
    pub model_earned_balance: Points,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AwardRequest {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 256))]
    pub reason: String,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
    #[validate(length(min = 1, max = 128))]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DeductRequest {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 256))]
    pub reason: String,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
    #[validate(length(min = 1, max = 128))]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceChangeResult {
    pub transaction_id: TransactionId,
    pub previous_balance: Points,
    pub new_balance: Points,
}

// ============================================================
// ENGINE
// ============================================================

pub struct WalletEngine {
    store: Arc<dyn Store>,
    ledger: Arc<LedgerService>,
    idempotency: Arc<IdempotencyService>,
    bus: Arc<EventBus>,
    authorizer: Arc<QueueAuthorizer>,
    config: WalletConfig,
}

impl WalletEngine {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<LedgerService>,
        idempotency: Arc<IdempotencyService>,
        bus: Arc<EventBus>,
        authorizer: Arc<QueueAuthorizer>,
        config: WalletConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            idempotency,
            bus,
            authorizer,
            config,
        }
    }

    // ============================================================
    // READS
    // ============================================================

    /// Missing wallets read as zeros; nothing is created.
    pub async fn get_user_balance(&self, user_id: &str) -> Result<UserBalance, PointsError> {
        let user_id = validate_identifier("user_id", user_id, MAX_IDENTIFIER_LEN)?;
        Ok(match self.store.get_wallet(&user_id).await? {
            Some(w) => UserBalance {
                user_id,
                available_balance: w.available(),
                escrow_balance: w.escrow(),
            },
            None => UserBalance {
                user_id,
                available_balance: 0,
                escrow_balance: 0,
            },
        })
    }

    pub async fn get_model_balance(&self, model_id: &str) -> Result<Points, PointsError> {
        let model_id = validate_identifier("model_id", model_id, MAX_IDENTIFIER_LEN)?;
        Ok(self
            .store
            .get_model_wallet(&model_id)
            .await?
            .map(|w| w.earned())
            .unwrap_or(0))
    }

    pub async fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowItem>, PointsError> {
        let escrow_id = validate_identifier("escrow_id", escrow_id, MAX_IDENTIFIER_LEN)?;
        self.store.get_escrow(&escrow_id).await
    }

    pub async fn list_escrows(
        &self,
        user_id: &str,
        status: Option<EscrowStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<EscrowItem>, PointsError> {
        let user_id = validate_identifier("user_id", user_id, MAX_IDENTIFIER_LEN)?;
        self.store.list_escrows(&user_id, status, limit, offset).await
    }

    // ============================================================
    // HOLD
    // ============================================================

    /// Move `amount` from available into escrow, earmarked for one external
    /// work item.
    pub async fn hold_in_escrow(&self, request: HoldRequest) -> Result<HoldResult, PointsError> {
        request
            .validate()
            .map_err(|e| PointsError::InvalidInput(e.to_string()))?;
        let user_id = validate_identifier("user_id", &request.user_id, MAX_IDENTIFIER_LEN)?;
        let queue_item_id =
            validate_identifier("queue_item_id", &request.queue_item_id, MAX_IDENTIFIER_LEN)?;
        let feature_type =
            validate_identifier("feature_type", &request.feature_type, MAX_IDENTIFIER_LEN)?;
        let reason = validate_reason(&request.reason)?;
        let amount = validate_positive_amount("amount", request.amount)?;
        let key = IdempotencyKey::new(&request.idempotency_key)?;

        if let Some(stored) = self.replay::<HoldResult>(&key, EventScope::HoldEscrow).await? {
            return Ok(stored);
        }

        let metadata = request.metadata.unwrap_or_else(|| serde_json::json!({}));

        // OCC loop. Each attempt creates a tentative escrow row; a lost
        // wallet CAS removes it before the re-read so the operation stays
        // net-idempotent.
        let attempts = self.config.max_retry_attempts.max(1);
        let mut outcome = None;
        for attempt in 1..=attempts {
            let wallet = self
                .store
                .create_wallet_if_absent(Wallet::new(user_id.clone()))
                .await?;
            let expected_version = wallet.version();
            let previous_balance = wallet.available();

            if wallet.available() < amount {
                return Err(PointsError::InsufficientBalance);
            }

            let item = EscrowItem::held(
                new_id("esc"),
                user_id.clone(),
                amount,
                queue_item_id.clone(),
                feature_type.clone(),
                reason.clone(),
                metadata.clone(),
            );
            let escrow_id = item.escrow_id.clone();
            match self.store.insert_escrow(item).await? {
                InsertOutcome::Created(_) => {}
                InsertOutcome::Duplicate(existing) => {
                    // someone else already bound this work item
                    return Err(PointsError::InvalidInput(format!(
                        "queue item {} already has escrow {}",
                        queue_item_id, existing.escrow_id
                    )));
                }
            }

            let mut updated = wallet.clone();
            updated
                .hold(amount)
                .map_err(|e| PointsError::Internal(e.to_string()))?;

            if self
                .store
                .update_wallet_if_version(&updated, expected_version)
                .await?
            {
                outcome = Some((escrow_id, previous_balance, updated));
                break;
            }

            // lost the race: roll back the tentative escrow and retry
            self.store.delete_escrow_if_held(&escrow_id).await?;
            if attempt < attempts {
                tokio::time::sleep(crate::wallet::occ::backoff_delay(&self.config, attempt)).await;
            }
        }

        let Some((escrow_id, previous_balance, wallet)) = outcome else {
            return Err(PointsError::OptimisticLockConflict);
        };

        let transaction_id = new_id("txn");
        let escrow_before = wallet.escrow() - amount;

        // paired entries: debit available first, then credit escrow
        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: user_id.clone(),
                account_type: AccountType::User,
                amount: -(amount as i64),
                entry_type: EntryType::Debit,
                balance_state: BalanceState::Available,
                state_transition: state_transition(BalanceState::Available, BalanceState::Escrow),
                reason: reason.clone(),
                idempotency_key: key.derived("debit"),
                request_id: request.request_id.clone(),
                balance_before: previous_balance,
                balance_after: wallet.available(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: Some(escrow_id.clone()),
                queue_item_id: Some(queue_item_id.clone()),
                feature_type: Some(feature_type.clone()),
                correlation_id: Some(request.request_id.clone()),
                metadata: metadata.clone(),
            })
            .await?;
        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: user_id.clone(),
                account_type: AccountType::User,
                amount: amount as i64,
                entry_type: EntryType::Credit,
                balance_state: BalanceState::Escrow,
                state_transition: state_transition(BalanceState::Available, BalanceState::Escrow),
                reason: reason.clone(),
                idempotency_key: key.derived("credit"),
                request_id: request.request_id.clone(),
                balance_before: escrow_before,
                balance_after: wallet.escrow(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: Some(escrow_id.clone()),
                queue_item_id: Some(queue_item_id.clone()),
                feature_type: Some(feature_type),
                correlation_id: Some(request.request_id.clone()),
                metadata: metadata.clone(),
            })
            .await?;

        let result = HoldResult {
            transaction_id: transaction_id.clone(),
            escrow_id: escrow_id.clone(),
            previous_balance,
            new_available_balance: wallet.available(),
            escrow_balance: wallet.escrow(),
        };
        self.store_result(&key, EventScope::HoldEscrow, &result, 201)
            .await?;

        info!(
            user_id = %user_id,
            escrow_id = %escrow_id,
            tx_id = %transaction_id,
            amount,
            "escrow held"
        );

        self.bus
            .publish(PointsEvent::new(
                EVENT_SOURCE,
                key.as_str().to_string(),
                EventPayload::EscrowHeld {
                    user_id,
                    escrow_id,
                    queue_item_id,
                    amount,
                    user_available: result.new_available_balance,
                    user_escrow: result.escrow_balance,
                    transaction_id,
                },
            ))
            .await;

        Ok(result)
    }

    // ============================================================
    // SETTLE
    // ============================================================

    /// Settle a held escrow to a counterparty, gated by a settlement
    /// capability token.
    pub async fn settle_escrow(
        &self,
        request: SettleRequest,
        token: &str,
    ) -> Result<SettleResult, PointsError> {
        request
            .validate()
            .map_err(|e| PointsError::InvalidInput(e.to_string()))?;
        let escrow_id = validate_identifier("escrow_id", &request.escrow_id, MAX_IDENTIFIER_LEN)?;
        let queue_item_id =
            validate_identifier("queue_item_id", &request.queue_item_id, MAX_IDENTIFIER_LEN)?;
        let model_id = validate_identifier("model_id", &request.model_id, MAX_IDENTIFIER_LEN)?;
        let amount = validate_positive_amount("amount", request.amount)?;
        let key = IdempotencyKey::new(&request.idempotency_key)?;

        let claims = self.authorizer.validate(
            token,
            CapabilityType::QueueSettlement,
            &queue_item_id,
            &escrow_id,
        )?;
        Self::check_token_amount(&claims, amount)?;

        if let Some(stored) = self
            .replay::<SettleResult>(&key, EventScope::SettleEscrow)
            .await?
        {
            return Ok(stored);
        }

        let escrow = self.load_held_escrow(&escrow_id, &queue_item_id, amount).await?;

        // model wallet first: lazily created, earned is monotone
        let model = self.credit_model(&model_id, amount).await?;

        // then the user's escrow bucket
        let user = self
            .mutate_user_wallet(&escrow.user_id, |w| w.consume_escrow(amount))
            .await?;

        let processed_at = now();
        if !self
            .store
            .transition_escrow(&escrow_id, EscrowStatus::Settled, Some(&model_id), processed_at)
            .await?
        {
            // A concurrent resolution won between our status read and this
            // CAS. Balances have moved; surface loudly for the operator.
            error!(
                escrow_id = %escrow_id,
                "escrow terminal before settle transition; balances need review"
            );
            return Err(PointsError::EscrowAlreadyProcessed(escrow_id));
        }

        let transaction_id = new_id("txn");
        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: model_id.clone(),
                account_type: AccountType::Model,
                amount: amount as i64,
                entry_type: EntryType::Credit,
                balance_state: BalanceState::Earned,
                state_transition: state_transition(BalanceState::Escrow, BalanceState::Earned),
                reason: escrow.reason.clone(),
                idempotency_key: key.derived("settle"),
                request_id: request.request_id.clone(),
                balance_before: model.earned() - amount,
                balance_after: model.earned(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: Some(escrow_id.clone()),
                queue_item_id: Some(queue_item_id.clone()),
                feature_type: Some(escrow.feature_type.clone()),
                correlation_id: Some(request.request_id.clone()),
                metadata: escrow.metadata.clone(),
            })
            .await?;

        let result = SettleResult {
            transaction_id: transaction_id.clone(),
            settled_amount: amount,
            model_earned_balance: model.earned(),
        };
        self.store_result(&key, EventScope::SettleEscrow, &result, 200)
            .await?;

        info!(
            escrow_id = %escrow_id,
            model_id = %model_id,
            tx_id = %transaction_id,
            amount,
            "escrow settled"
        );

        self.bus
            .publish(PointsEvent::new(
                EVENT_SOURCE,
                key.as_str().to_string(),
                EventPayload::EscrowSettled {
                    user_id: escrow.user_id,
                    model_id,
                    escrow_id,
                    queue_item_id,
                    amount,
                    user_escrow: user.escrow(),
                    model_earned: model.earned(),
                    transaction_id,
                },
            ))
            .await;

        Ok(result)
    }

    // ============================================================
    // REFUND
    // ============================================================

    /// Return a held escrow to the user's available balance, gated by a
    /// refund capability token.
    pub async fn refund_escrow(
        &self,
        request: RefundRequest,
        token: &str,
    ) -> Result<RefundResult, PointsError> {
        request
            .validate()
            .map_err(|e| PointsError::InvalidInput(e.to_string()))?;
        let escrow_id = validate_identifier("escrow_id", &request.escrow_id, MAX_IDENTIFIER_LEN)?;
        let queue_item_id =
            validate_identifier("queue_item_id", &request.queue_item_id, MAX_IDENTIFIER_LEN)?;
        let amount = validate_positive_amount("amount", request.amount)?;
        let key = IdempotencyKey::new(&request.idempotency_key)?;

        let claims = self.authorizer.validate(
            token,
            CapabilityType::QueueRefund,
            &queue_item_id,
            &escrow_id,
        )?;
        Self::check_token_amount(&claims, amount)?;

        if let Some(stored) = self
            .replay::<RefundResult>(&key, EventScope::RefundEscrow)
            .await?
        {
            return Ok(stored);
        }

        let escrow = self.load_held_escrow(&escrow_id, &queue_item_id, amount).await?;

        // single OCC cycle moves escrow back to available
        let user = self
            .mutate_user_wallet(&escrow.user_id, |w| w.release(amount))
            .await?;

        let processed_at = now();
        if !self
            .store
            .transition_escrow(&escrow_id, EscrowStatus::Refunded, None, processed_at)
            .await?
        {
            error!(
                escrow_id = %escrow_id,
                "escrow terminal before refund transition; balances need review"
            );
            return Err(PointsError::EscrowAlreadyProcessed(escrow_id));
        }

        let transaction_id = new_id("txn");
        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: escrow.user_id.clone(),
                account_type: AccountType::User,
                amount: amount as i64,
                entry_type: EntryType::Credit,
                balance_state: BalanceState::Available,
                state_transition: state_transition(BalanceState::Escrow, BalanceState::Available),
                reason: escrow.reason.clone(),
                idempotency_key: key.derived("refund"),
                request_id: request.request_id.clone(),
                balance_before: user.available() - amount,
                balance_after: user.available(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: Some(escrow_id.clone()),
                queue_item_id: Some(queue_item_id.clone()),
                feature_type: Some(escrow.feature_type.clone()),
                correlation_id: Some(request.request_id.clone()),
                metadata: escrow.metadata.clone(),
            })
            .await?;

        let result = RefundResult {
            transaction_id: transaction_id.clone(),
            refunded_amount: amount,
            user_available_balance: user.available(),
        };
        self.store_result(&key, EventScope::RefundEscrow, &result, 200)
            .await?;

        info!(
            escrow_id = %escrow_id,
            tx_id = %transaction_id,
            amount,
            "escrow refunded"
        );

        self.bus
            .publish(PointsEvent::new(
                EVENT_SOURCE,
                key.as_str().to_string(),
                EventPayload::EscrowRefunded {
                    user_id: escrow.user_id,
                    escrow_id,
                    queue_item_id,
                    amount,
                    user_available: user.available(),
                    user_escrow: user.escrow(),
                    transaction_id,
                },
            ))
            .await;

        Ok(result)
    }

    // ============================================================
    // PARTIAL SETTLE
    // ============================================================

    /// Split a held escrow into a refund leg and a settlement leg. The
    /// escrow terminates as `settled` with the counterparty recorded.
    pub async fn partial_settle_escrow(
        &self,
        request: PartialSettleRequest,
        token: &str,
    ) -> Result<PartialSettleResult, PointsError> {
        request
            .validate()
            .map_err(|e| PointsError::InvalidInput(e.to_string()))?;
        let escrow_id = validate_identifier("escrow_id", &request.escrow_id, MAX_IDENTIFIER_LEN)?;
        let queue_item_id =
            validate_identifier("queue_item_id", &request.queue_item_id, MAX_IDENTIFIER_LEN)?;
        let model_id = validate_identifier("model_id", &request.model_id, MAX_IDENTIFIER_LEN)?;
        let refund_amount = validate_positive_amount("refund_amount", request.refund_amount)?;
        let settle_amount = validate_positive_amount("settle_amount", request.settle_amount)?;
        let key = IdempotencyKey::new(&request.idempotency_key)?;

        let claims = self.authorizer.validate(
            token,
            CapabilityType::QueuePartialSettlement,
            &queue_item_id,
            &escrow_id,
        )?;
        if claims.refund_amount.is_some_and(|a| a != refund_amount)
            || claims.settle_amount.is_some_and(|a| a != settle_amount)
        {
            return Err(PointsError::InvalidAuthorization(
                "token amounts do not match request".into(),
            ));
        }

        if let Some(stored) = self
            .replay::<PartialSettleResult>(&key, EventScope::PartialSettleEscrow)
            .await?
        {
            return Ok(stored);
        }

        let total = refund_amount
            .checked_add(settle_amount)
            .ok_or_else(|| PointsError::InvalidInput("amount overflow".into()))?;
        let escrow = self.load_held_escrow(&escrow_id, &queue_item_id, total).await?;

        // user wallet: both legs resolve in one OCC cycle
        let user = self
            .mutate_user_wallet(&escrow.user_id, |w| {
                w.split_escrow(refund_amount, settle_amount)
            })
            .await?;

        // model wallet under its own OCC cycle
        let model = self.credit_model(&model_id, settle_amount).await?;

        let processed_at = now();
        if !self
            .store
            .transition_escrow(&escrow_id, EscrowStatus::Settled, Some(&model_id), processed_at)
            .await?
        {
            error!(
                escrow_id = %escrow_id,
                "escrow terminal before partial-settle transition; balances need review"
            );
            return Err(PointsError::EscrowAlreadyProcessed(escrow_id));
        }

        let transaction_id = new_id("txn");

        // user refund leg first, then model settle leg
        let refund_entry = CreateEntryRequest {
            account_id: escrow.user_id.clone(),
            account_type: AccountType::User,
            amount: refund_amount as i64,
            entry_type: EntryType::Credit,
            balance_state: BalanceState::Available,
            state_transition: state_transition(BalanceState::Escrow, BalanceState::Available),
            reason: escrow.reason.clone(),
            idempotency_key: key.derived("refund"),
            request_id: request.request_id.clone(),
            balance_before: user.available() - refund_amount,
            balance_after: user.available(),
            transaction_id: Some(transaction_id.clone()),
            escrow_id: Some(escrow_id.clone()),
            queue_item_id: Some(queue_item_id.clone()),
            feature_type: Some(escrow.feature_type.clone()),
            correlation_id: Some(request.request_id.clone()),
            metadata: escrow.metadata.clone(),
        };
        self.ledger.create_entry(refund_entry).await?;

        let settle_entry = CreateEntryRequest {
            account_id: model_id.clone(),
            account_type: AccountType::Model,
            amount: settle_amount as i64,
            entry_type: EntryType::Credit,
            balance_state: BalanceState::Earned,
            state_transition: state_transition(BalanceState::Escrow, BalanceState::Earned),
            reason: escrow.reason.clone(),
            idempotency_key: key.derived("settle"),
            request_id: request.request_id.clone(),
            balance_before: model.earned() - settle_amount,
            balance_after: model.earned(),
            transaction_id: Some(transaction_id.clone()),
            escrow_id: Some(escrow_id.clone()),
            queue_item_id: Some(queue_item_id.clone()),
            feature_type: Some(escrow.feature_type.clone()),
            correlation_id: Some(request.request_id.clone()),
            metadata: escrow.metadata.clone(),
        };
        if let Err(e) = self.ledger.create_entry(settle_entry.clone()).await {
            // The wallet state is committed; the missing leg is repaired
            // through the ingest pipeline, which re-submits the idempotent
            // create until it lands.
            warn!(
                escrow_id = %escrow_id,
                tx_id = %transaction_id,
                error = %e,
                "settle leg write failed after wallet commit, queueing repair"
            );
            self.enqueue_ledger_repair(&settle_entry).await?;
            return Err(e);
        }

        let result = PartialSettleResult {
            transaction_id: transaction_id.clone(),
            refunded_amount: refund_amount,
            settled_amount: settle_amount,
            user_available_balance: user.available(),
            model_earned_balance: model.earned(),
        };
        self.store_result(&key, EventScope::PartialSettleEscrow, &result, 200)
            .await?;

        info!(
            escrow_id = %escrow_id,
            model_id = %model_id,
            tx_id = %transaction_id,
            refund_amount,
            settle_amount,
            "escrow partially settled"
        );

        self.bus
            .publish(PointsEvent::new(
                EVENT_SOURCE,
                key.as_str().to_string(),
                EventPayload::EscrowPartialSettled {
                    user_id: escrow.user_id,
                    model_id,
                    escrow_id,
                    queue_item_id,
                    refund_amount,
                    settle_amount,
                    user_available: user.available(),
                    user_escrow: user.escrow(),
                    model_earned: model.earned(),
                    transaction_id,
                },
            ))
            .await;

        Ok(result)
    }

    // ============================================================
    // AWARD / DEDUCT
    // ============================================================

    /// Direct accrual to available. Every accrual produces a ledger entry.
    pub async fn award_points(
        &self,
        request: AwardRequest,
    ) -> Result<BalanceChangeResult, PointsError> {
        request
            .validate()
            .map_err(|e| PointsError::InvalidInput(e.to_string()))?;
        let user_id = validate_identifier("user_id", &request.user_id, MAX_IDENTIFIER_LEN)?;
        let reason = validate_reason(&request.reason)?;
        let amount = validate_positive_amount("amount", request.amount)?;
        let key = IdempotencyKey::new(&request.idempotency_key)?;

        if let Some(stored) = self
            .replay::<BalanceChangeResult>(&key, EventScope::Award)
            .await?
        {
            return Ok(stored);
        }

        let (previous, wallet) = self
            .mutate_user_wallet_with_previous(&user_id, |w| w.credit(amount))
            .await?;

        let transaction_id = new_id("txn");
        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: user_id.clone(),
                account_type: AccountType::User,
                amount: amount as i64,
                entry_type: EntryType::Credit,
                balance_state: BalanceState::Available,
                state_transition: "none->available".into(),
                reason: reason.clone(),
                idempotency_key: key.derived("award"),
                request_id: request.request_id.clone(),
                balance_before: previous,
                balance_after: wallet.available(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: None,
                queue_item_id: None,
                feature_type: None,
                correlation_id: Some(request.request_id.clone()),
                metadata: serde_json::json!({}),
            })
            .await?;

        let result = BalanceChangeResult {
            transaction_id,
            previous_balance: previous,
            new_balance: wallet.available(),
        };
        self.store_result(&key, EventScope::Award, &result, 201).await?;

        self.bus
            .publish(PointsEvent::new(
                EVENT_SOURCE,
                key.as_str().to_string(),
                EventPayload::BalanceUpdated {
                    user_id,
                    previous_available: previous,
                    available: wallet.available(),
                    escrow: wallet.escrow(),
                    reason,
                },
            ))
            .await;

        Ok(result)
    }

    /// Direct debit from available.
    pub async fn deduct_points(
        &self,
        request: DeductRequest,
    ) -> Result<BalanceChangeResult, PointsError> {
        request
            .validate()
            .map_err(|e| PointsError::InvalidInput(e.to_string()))?;
        let user_id = validate_identifier("user_id", &request.user_id, MAX_IDENTIFIER_LEN)?;
        let reason = validate_reason(&request.reason)?;
        let amount = validate_positive_amount("amount", request.amount)?;
        let key = IdempotencyKey::new(&request.idempotency_key)?;

        if let Some(stored) = self
            .replay::<BalanceChangeResult>(&key, EventScope::Deduct)
            .await?
        {
            return Ok(stored);
        }

        let (previous, wallet) = self
            .mutate_user_wallet_with_previous(&user_id, |w| w.debit(amount))
            .await?;

        let transaction_id = new_id("txn");
        self.ledger
            .create_entry(CreateEntryRequest {
                account_id: user_id.clone(),
                account_type: AccountType::User,
                amount: -(amount as i64),
                entry_type: EntryType::Debit,
                balance_state: BalanceState::Available,
                state_transition: "available->none".into(),
                reason: reason.clone(),
                idempotency_key: key.derived("deduct"),
                request_id: request.request_id.clone(),
                balance_before: previous,
                balance_after: wallet.available(),
                transaction_id: Some(transaction_id.clone()),
                escrow_id: None,
                queue_item_id: None,
                feature_type: None,
                correlation_id: Some(request.request_id.clone()),
                metadata: serde_json::json!({}),
            })
            .await?;

        let result = BalanceChangeResult {
            transaction_id,
            previous_balance: previous,
            new_balance: wallet.available(),
        };
        self.store_result(&key, EventScope::Deduct, &result, 200).await?;

        self.bus
            .publish(PointsEvent::new(
                EVENT_SOURCE,
                key.as_str().to_string(),
                EventPayload::BalanceUpdated {
                    user_id,
                    previous_available: previous,
                    available: wallet.available(),
                    escrow: wallet.escrow(),
                    reason,
                },
            ))
            .await;

        Ok(result)
    }

    // ============================================================
    // HELPERS
    // ============================================================

    fn check_token_amount(claims: &CapabilityClaims, amount: Points) -> Result<(), PointsError> {
        if claims.amount.is_some_and(|a| a != amount) {
            return Err(PointsError::InvalidAuthorization(
                "token amount does not match request".into(),
            ));
        }
        Ok(())
    }

    /// Load an escrow that must exist, be `held`, belong to the presented
    /// queue item, and carry the expected amount.
    async fn load_held_escrow(
        &self,
        escrow_id: &str,
        queue_item_id: &str,
        expected_amount: Points,
    ) -> Result<EscrowItem, PointsError> {
        let escrow = self
            .store
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| PointsError::EscrowNotFound(escrow_id.to_string()))?;

        if escrow.status != EscrowStatus::Held {
            return Err(PointsError::EscrowAlreadyProcessed(escrow_id.to_string()));
        }
        if escrow.queue_item_id != queue_item_id {
            return Err(PointsError::InvalidInput(
                "queue item does not match escrow".into(),
            ));
        }
        if escrow.amount != expected_amount {
            return Err(PointsError::InvalidInput(format!(
                "amount {} does not match held amount {}",
                expected_amount, escrow.amount
            )));
        }
        Ok(escrow)
    }

    /// OCC cycle on a user wallet that must already exist.
    async fn mutate_user_wallet(
        &self,
        user_id: &str,
        mutate: impl Fn(&mut Wallet) -> Result<(), &'static str> + Copy,
    ) -> Result<Wallet, PointsError> {
        Ok(self
            .mutate_user_wallet_with_previous(user_id, mutate)
            .await?
            .1)
    }

    async fn mutate_user_wallet_with_previous(
        &self,
        user_id: &str,
        mutate: impl Fn(&mut Wallet) -> Result<(), &'static str> + Copy,
    ) -> Result<(Points, Wallet), PointsError> {
        let store = &self.store;
        with_occ_retry(&self.config, "user_wallet", move || async move {
            let wallet = store
                .create_wallet_if_absent(Wallet::new(user_id.to_string()))
                .await?;
            let expected = wallet.version();
            let previous = wallet.available();

            let mut updated = wallet;
            mutate(&mut updated).map_err(|e| match e {
                "Insufficient available balance" | "Insufficient escrow balance" => {
                    PointsError::InsufficientBalance
                }
                other => PointsError::Internal(other.to_string()),
            })?;

            if store.update_wallet_if_version(&updated, expected).await? {
                Ok(OccAttempt::Committed((previous, updated)))
            } else {
                Ok(OccAttempt::Conflict)
            }
        })
        .await
    }

    /// OCC cycle crediting a model's earned balance, creating the wallet
    /// lazily.
    async fn credit_model(&self, model_id: &str, amount: Points) -> Result<ModelWallet, PointsError> {
        let store = &self.store;
        with_occ_retry(&self.config, "model_wallet", move || async move {
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

    /// Replay a stored result for `(key, scope)` if present.
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
            Some(stored) => {
                let value = serde_json::from_value(stored)
                    .map_err(|e| PointsError::Internal(format!("stored result corrupt: {e}")))?;
                Ok(Some(value))
            }
            // duplicate but past the operational replay window
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

    /// Queue a completion-repair job for a ledger entry whose write failed
    /// after the wallet state was committed.
    async fn enqueue_ledger_repair(&self, entry: &CreateEntryRequest) -> Result<(), PointsError> {
        let payload = serde_json::to_value(entry)
            .map_err(|e| PointsError::Internal(format!("repair payload failed: {e}")))?;
        let event = IngestEvent::queued(
            format!("repair-{}", entry.idempotency_key),
            LEDGER_REPAIR_EVENT_TYPE.to_string(),
            payload,
        );
        self.store.enqueue_event(event).await?;
        Ok(())
    }
}
