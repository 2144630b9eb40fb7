//! Ledger entry record and creation request
//!
//! Two laws hold for every entry and are checked before anything is
//! persisted:
//! - `balance_after - balance_before == amount`
//! - the sign of `amount` matches the entry type (credit > 0, debit < 0)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{
    AccountType, BalanceState, EntryId, EntryType, Points, SignedPoints, TransactionId,
};
use crate::error::PointsError;
use crate::validation::{MAX_IDENTIFIER_LEN, validate_identifier, validate_reason};

/// Render the bucket movement of an entry, e.g. `available->escrow`.
pub fn state_transition(from: BalanceState, to: BalanceState) -> String {
    format!("{}->{}", from.as_str(), to.as_str())
}

/// Immutable record of one value movement in one balance bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    /// Groups the paired entries of one operation.
    pub transaction_id: TransactionId,
    pub account_id: String,
    pub account_type: AccountType,
    /// Signed; negative for debits.
    pub amount: SignedPoints,
    pub entry_type: EntryType,
    pub balance_state: BalanceState,
    /// e.g. `available->escrow`
    pub state_transition: String,
    pub reason: String,
    /// Globally unique across all entries.
    pub idempotency_key: String,
    pub request_id: String,
    pub balance_before: Points,
    pub balance_after: Points,
    pub timestamp: DateTime<Utc>,
    pub currency: String,
    pub escrow_id: Option<String>,
    pub queue_item_id: Option<String>,
    pub feature_type: Option<String>,
    pub correlation_id: Option<String>,
    /// PII-free structured metadata.
    pub metadata: serde_json::Value,
}

/// Inputs for creating one ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEntryRequest {
    pub account_id: String,
    pub account_type: AccountType,
    pub amount: SignedPoints,
    pub entry_type: EntryType,
    pub balance_state: BalanceState,
    pub state_transition: String,
    pub reason: String,
    pub idempotency_key: String,
    pub request_id: String,
    pub balance_before: Points,
    pub balance_after: Points,
    #[serde(default)]
    pub transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub escrow_id: Option<String>,
    #[serde(default)]
    pub queue_item_id: Option<String>,
    #[serde(default)]
    pub feature_type: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

impl CreateEntryRequest {
    /// Validate the two ledger laws plus identifier hygiene.
    pub fn validate(&self) -> Result<(), PointsError> {
        validate_identifier("account_id", &self.account_id, MAX_IDENTIFIER_LEN)?;
        validate_reason(&self.reason)?;

        if self.amount == 0 {
            return Err(PointsError::InvalidInput(
                "amount must be non-zero".into(),
            ));
        }
        if !self.entry_type.sign_matches(self.amount) {
            return Err(PointsError::InvalidInput(format!(
                "amount sign does not match entry type {}",
                self.entry_type
            )));
        }

        let delta = self.balance_after as i128 - self.balance_before as i128;
        if delta != self.amount as i128 {
            return Err(PointsError::InvalidInput(format!(
                "balance_after - balance_before = {delta} but amount = {}",
                self.amount
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> CreateEntryRequest {
        CreateEntryRequest {
            account_id: "u1".into(),
            account_type: AccountType::User,
            amount: -100,
            entry_type: EntryType::Debit,
            balance_state: BalanceState::Available,
            state_transition: state_transition(BalanceState::Available, BalanceState::Escrow),
            reason: "escrow_hold".into(),
            idempotency_key: format!("{}_debit", uuid::Uuid::new_v4()),
            request_id: "req-1".into(),
            balance_before: 1000,
            balance_after: 900,
            transaction_id: None,
            escrow_id: Some("esc_1".into()),
            queue_item_id: Some("q1".into()),
            feature_type: Some("slot_machine".into()),
            correlation_id: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn test_balance_law() {
        let mut req = valid_request();
        req.balance_after = 950; // delta -50 but amount -100
        let err = req.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_sign_law() {
        let mut req = valid_request();
        req.amount = 100; // positive amount on a debit
        req.balance_after = 1100;
        assert!(req.validate().is_err());

        let mut req = valid_request();
        req.entry_type = EntryType::Credit; // credit with negative amount
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_zero_amount_rejected() {
        let mut req = valid_request();
        req.amount = 0;
        req.balance_after = req.balance_before;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_hostile_account_id_rejected() {
        let mut req = valid_request();
        req.account_id = "{$ne: null}".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_state_transition_format() {
        assert_eq!(
            state_transition(BalanceState::Escrow, BalanceState::Earned),
            "escrow->earned"
        );
    }
}
