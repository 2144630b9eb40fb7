//! Event envelope and wallet lifecycle event types
//!
//! Every event carries enough before/after state for a downstream projection
//! to update itself without re-reading the authoritative store.

pub mod balance_cache;
pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Points, new_id, now};

pub use balance_cache::{BalanceCache, CachedBalance};
pub use bus::{EventBus, EventHandler, HandlerFailure, PublishMode, PublishResult};

/// Envelope schema version.
pub const EVENT_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    BalanceUpdated,
    EscrowHeld,
    EscrowSettled,
    EscrowRefunded,
    EscrowPartialSettled,
    LedgerEntryCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BalanceUpdated => "BALANCE_UPDATED",
            EventType::EscrowHeld => "ESCROW_HELD",
            EventType::EscrowSettled => "ESCROW_SETTLED",
            EventType::EscrowRefunded => "ESCROW_REFUNDED",
            EventType::EscrowPartialSettled => "ESCROW_PARTIAL_SETTLED",
            EventType::LedgerEntryCreated => "LEDGER_ENTRY_CREATED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type-specific payloads. Balances are post-operation values unless a
/// field says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    BalanceUpdated {
        user_id: String,
        previous_available: Points,
        available: Points,
        escrow: Points,
        reason: String,
    },
    EscrowHeld {
        user_id: String,
        escrow_id: String,
        queue_item_id: String,
        amount: Points,
        user_available: Points,
        user_escrow: Points,
        transaction_id: String,
    },
    EscrowSettled {
        user_id: String,
        model_id: String,
        escrow_id: String,
        queue_item_id: String,
        amount: Points,
        user_escrow: Points,
        model_earned: Points,
        transaction_id: String,
    },
    EscrowRefunded {
        user_id: String,
        escrow_id: String,
        queue_item_id: String,
        amount: Points,
        user_available: Points,
        user_escrow: Points,
        transaction_id: String,
    },
    EscrowPartialSettled {
        user_id: String,
        model_id: String,
        escrow_id: String,
        queue_item_id: String,
        refund_amount: Points,
        settle_amount: Points,
        user_available: Points,
        user_escrow: Points,
        model_earned: Points,
        transaction_id: String,
    },
    LedgerEntryCreated {
        entry_id: String,
        transaction_id: String,
        account_id: String,
        amount: i64,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::BalanceUpdated { .. } => EventType::BalanceUpdated,
            EventPayload::EscrowHeld { .. } => EventType::EscrowHeld,
            EventPayload::EscrowSettled { .. } => EventType::EscrowSettled,
            EventPayload::EscrowRefunded { .. } => EventType::EscrowRefunded,
            EventPayload::EscrowPartialSettled { .. } => EventType::EscrowPartialSettled,
            EventPayload::LedgerEntryCreated { .. } => EventType::LedgerEntryCreated,
        }
    }
}

/// The envelope published over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointsEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub version: u16,
    pub payload: EventPayload,
}

impl PointsEvent {
    pub fn new(source: &str, idempotency_key: String, payload: EventPayload) -> Self {
        Self {
            event_id: new_id("evt"),
            event_type: payload.event_type(),
            idempotency_key,
            timestamp: now(),
            source: source.to_string(),
            version: EVENT_SCHEMA_VERSION,
            payload,
        }
    }
}
