//! Core types used throughout the system
//!
//! All entity identifiers are opaque strings supplied by callers or minted
//! internally as ULIDs. Balances are non-negative integers in a single unit
//! ("points"); ledger amounts are signed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User ID - opaque string key for a user wallet.
pub type UserId = String;

/// Model (counterparty) ID - opaque string key for an earnings wallet.
pub type ModelId = String;

/// Escrow ID - unique key of one escrow item (ULID).
pub type EscrowId = String;

/// External queue work-item ID - at most one escrow per queue item.
pub type QueueItemId = String;

/// Ledger entry ID (ULID).
pub type EntryId = String;

/// Transaction ID - groups the paired ledger entries of one operation.
pub type TransactionId = String;

/// Reservation ID (ULID).
pub type ReservationId = String;

/// Ingest event ID - caller-supplied, validated before any store access.
pub type EventId = String;

/// Balance in points. Never negative.
pub type Points = u64;

/// Signed ledger amount in points.
pub type SignedPoints = i64;

/// UTC timestamp used on every persisted record.
pub type Timestamp = DateTime<Utc>;

/// Which side of the ledger an account lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    User,
    Model,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::User => "user",
            AccountType::Model => "model",
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The balance bucket a ledger entry touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceState {
    Available,
    Escrow,
    Earned,
}

impl BalanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceState::Available => "available",
            BalanceState::Escrow => "escrow",
            BalanceState::Earned => "earned",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" => Some(BalanceState::Available),
            "escrow" => Some(BalanceState::Escrow),
            "earned" => Some(BalanceState::Earned),
            _ => None,
        }
    }
}

impl std::fmt::Display for BalanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a ledger entry. The sign of the amount must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Credit => "credit",
            EntryType::Debit => "debit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(EntryType::Credit),
            "debit" => Some(EntryType::Debit),
            _ => None,
        }
    }

    /// Check that a signed amount carries the sign this type requires.
    pub fn sign_matches(&self, amount: SignedPoints) -> bool {
        match self {
            EntryType::Credit => amount > 0,
            EntryType::Debit => amount < 0,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mint a fresh ULID-based id with the given prefix.
///
/// ULIDs sort by creation time, which keeps secondary indexes on id columns
/// roughly append-ordered.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, ulid::Ulid::new().to_string().to_lowercase())
}

/// Current UTC time. Single call site so tests can reason about "now".
pub fn now() -> Timestamp {
    Utc::now()
}
