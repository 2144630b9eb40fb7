//! Escrow item state machine
//!
//! `held` is the only non-terminal state. The legal transitions are
//! `held -> settled` and `held -> refunded`; anything else is a bug in the
//! caller and the store-level CAS refuses it. Items are retained
//! indefinitely for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{EscrowId, ModelId, Points, QueueItemId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    Settled,
    Refunded,
}

impl EscrowStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EscrowStatus::Held)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Held => "held",
            EscrowStatus::Settled => "settled",
            EscrowStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "held" => Some(EscrowStatus::Held),
            "settled" => Some(EscrowStatus::Settled),
            "refunded" => Some(EscrowStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One held amount, earmarked for a specific external work item.
/// Uniquely keyed by `escrow_id` and, separately, by `queue_item_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscrowItem {
    pub escrow_id: EscrowId,
    pub user_id: UserId,
    pub amount: Points,
    pub status: EscrowStatus,
    pub queue_item_id: QueueItemId,
    pub feature_type: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub model_id: Option<ModelId>,
    /// PII-free caller metadata, carried through to ledger entries.
    pub metadata: serde_json::Value,
}

impl EscrowItem {
    pub fn held(
        escrow_id: EscrowId,
        user_id: UserId,
        amount: Points,
        queue_item_id: QueueItemId,
        feature_type: String,
        reason: String,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            escrow_id,
            user_id,
            amount,
            status: EscrowStatus::Held,
            queue_item_id,
            feature_type,
            reason,
            created_at: Utc::now(),
            processed_at: None,
            model_id: None,
            metadata,
        }
    }
}
