//! TTL-scoped reservations
//!
//! A thinner analog of escrow for when the counterparty is not yet known.
//! `active` is the only non-terminal state; a reservation whose clock has
//! passed `expires_at` is treated as expired even before the store says so.

pub mod service;
pub mod sweeper;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Points, ReservationId, TransactionId, UserId};

pub use service::{CommitResult, ReservationService, ReserveResult};
pub use sweeper::ReservationSweeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReservationStatus::Active),
            "committed" => Some(ReservationStatus::Committed),
            "released" => Some(ReservationStatus::Released),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A held amount with a deadline and no bound counterparty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    pub amount: Points,
    pub status: ReservationStatus,
    pub ttl_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Transaction that placed the hold.
    pub hold_transaction_id: TransactionId,
    /// Transaction that resolved it (commit, release, or expiry sweep).
    pub resolve_transaction_id: Option<TransactionId>,
}

impl Reservation {
    pub fn active(
        reservation_id: ReservationId,
        user_id: UserId,
        amount: Points,
        ttl_seconds: u64,
        hold_transaction_id: TransactionId,
    ) -> Self {
        let now = Utc::now();
        Self {
            reservation_id,
            user_id,
            amount,
            status: ReservationStatus::Active,
            ttl_seconds,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_seconds as i64),
            processed_at: None,
            hold_transaction_id,
            resolve_transaction_id: None,
        }
    }

    /// Expired by the clock, regardless of what the store row says.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ReservationStatus::Active.is_terminal());
        assert!(ReservationStatus::Committed.is_terminal());
        assert!(ReservationStatus::Released.is_terminal());
        assert!(ReservationStatus::Expired.is_terminal());
    }

    #[test]
    fn test_deadline() {
        let r = Reservation::active("res_1".into(), "u1".into(), 100, 300, "tx_1".into());
        assert!(!r.is_past_deadline(Utc::now()));
        assert!(r.is_past_deadline(Utc::now() + Duration::seconds(301)));
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            ReservationStatus::Active,
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::from_str(s.as_str()), Some(s));
        }
    }
}
