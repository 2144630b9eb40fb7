//! Storage traits
//!
//! The core assumes a persistent store with unique indexes, atomic
//! conditional updates, and TTL-style expiration. Two implementations ship:
//! an in-memory store (tests, dev mode) and Postgres. Both uphold the same
//! contention contract:
//!
//! - wallet/model/escrow/reservation rows mutate only through compare-and-set
//!   (`*_if_version`, `transition_*` from a named state), returning `false`
//!   when the precondition no longer holds;
//! - append-only collections (ledger, idempotency) race on unique keys;
//!   losers receive the winner's record, never an error.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core_types::Timestamp;
use crate::error::PointsError;
use crate::idempotency::{EventScope, IdempotencyRecord};
use crate::ingest::types::{DlqEntry, IngestEvent};
use crate::ledger::entry::LedgerEntry;
use crate::ledger::query::{LedgerFilter, LedgerPage};
use crate::reservation::{Reservation, ReservationStatus};
use crate::wallet::escrow::{EscrowItem, EscrowStatus};
use crate::wallet::models::{ModelWallet, Wallet};

/// Outcome of an insert into a unique-indexed, append-only collection.
#[derive(Debug, Clone)]
pub enum InsertOutcome<T> {
    Created(T),
    /// Unique-key race lost; the winner's record.
    Duplicate(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_record(self) -> T {
        match self {
            InsertOutcome::Created(t) | InsertOutcome::Duplicate(t) => t,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate(_))
    }
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_wallet(&self, user_id: &str) -> Result<Option<Wallet>, PointsError>;

    /// Lazily create a wallet; on a unique-key race the existing row wins.
    async fn create_wallet_if_absent(&self, wallet: Wallet) -> Result<Wallet, PointsError>;

    /// Conditional write predicated on the stored version being exactly
    /// `expected_version`. Returns false on version mismatch.
    async fn update_wallet_if_version(
        &self,
        wallet: &Wallet,
        expected_version: u64,
    ) -> Result<bool, PointsError>;

    async fn get_model_wallet(&self, model_id: &str) -> Result<Option<ModelWallet>, PointsError>;

    async fn create_model_wallet_if_absent(
        &self,
        wallet: ModelWallet,
    ) -> Result<ModelWallet, PointsError>;

    async fn update_model_wallet_if_version(
        &self,
        wallet: &ModelWallet,
        expected_version: u64,
    ) -> Result<bool, PointsError>;
}

#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Insert a fresh `held` item. Unique on both `escrow_id` and
    /// `queue_item_id`; a queue-item collision returns the existing item.
    async fn insert_escrow(
        &self,
        item: EscrowItem,
    ) -> Result<InsertOutcome<EscrowItem>, PointsError>;

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowItem>, PointsError>;

    async fn get_escrow_by_queue_item(
        &self,
        queue_item_id: &str,
    ) -> Result<Option<EscrowItem>, PointsError>;

    /// CAS `held -> to`. False when the item is missing or already terminal.
    async fn transition_escrow(
        &self,
        escrow_id: &str,
        to: EscrowStatus,
        model_id: Option<&str>,
        processed_at: Timestamp,
    ) -> Result<bool, PointsError>;

    /// Remove a tentative item that lost its wallet OCC race. Only `held`
    /// rows may be deleted.
    async fn delete_escrow_if_held(&self, escrow_id: &str) -> Result<bool, PointsError>;

    async fn list_escrows(
        &self,
        user_id: &str,
        status: Option<EscrowStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<EscrowItem>, PointsError>;
}

#[async_trait]
pub trait LedgerEntryStore: Send + Sync {
    /// Append an entry. Unique on `entry_id` and globally on
    /// `idempotency_key`; an idempotency-key collision returns the existing
    /// entry (the dedup fast-path, not an error).
    async fn insert_entry(
        &self,
        entry: LedgerEntry,
    ) -> Result<InsertOutcome<LedgerEntry>, PointsError>;

    async fn get_entry(&self, entry_id: &str) -> Result<Option<LedgerEntry>, PointsError>;

    async fn get_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerEntry>, PointsError>;

    async fn query_entries(&self, filter: &LedgerFilter) -> Result<LedgerPage, PointsError>;

    /// Entries sharing a transaction id, in timestamp order.
    async fn entries_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<LedgerEntry>, PointsError>;

    /// All entries for an account up to `as_of`, timestamp ascending.
    /// Snapshot and reconciliation reads.
    async fn entries_for_account(
        &self,
        account_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>, PointsError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// First writer wins; returns the existing record when the composite
    /// key `(key, scope)` is already present.
    async fn put_idempotency_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, PointsError>;

    async fn get_idempotency(
        &self,
        key: &str,
        scope: EventScope,
    ) -> Result<Option<IdempotencyRecord>, PointsError>;

    /// Drop rows past their compliance retention horizon. Operational
    /// expiry is a read-side decision, not a deletion.
    async fn purge_idempotency_past_retention(&self, now: Timestamp) -> Result<u64, PointsError>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), PointsError>;

    async fn get_reservation(&self, reservation_id: &str)
    -> Result<Option<Reservation>, PointsError>;

    /// CAS `active -> to`. False when missing or already terminal.
    async fn transition_reservation(
        &self,
        reservation_id: &str,
        to: ReservationStatus,
        processed_at: Timestamp,
        resolve_transaction_id: Option<&str>,
    ) -> Result<bool, PointsError>;

    /// Active rows whose deadline has passed, oldest first.
    async fn find_expired_reservations(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Reservation>, PointsError>;

    async fn list_reservations(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Reservation>, PointsError>;

    /// TTL-style eviction of long-dead terminal rows.
    async fn purge_reservations_before(&self, cutoff: Timestamp) -> Result<u64, PointsError>;
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Enqueue an event. False when the event id already exists.
    async fn enqueue_event(&self, event: IngestEvent) -> Result<bool, PointsError>;

    async fn get_event(&self, event_id: &str) -> Result<Option<IngestEvent>, PointsError>;

    /// Atomically claim up to `limit` due events: rows that are `queued`, or
    /// `processing` with `next_attempt_at <= now`. Claimed rows come back
    /// with `status = processing` and `attempts` already incremented; no two
    /// workers receive the same row.
    async fn claim_due_events(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<IngestEvent>, PointsError>;

    async fn mark_event_processed(&self, event_id: &str) -> Result<bool, PointsError>;

    async fn mark_event_rejected(
        &self,
        event_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, PointsError>;

    /// Schedule a retry: back to `queued` with a deadline.
    async fn requeue_event(
        &self,
        event_id: &str,
        next_attempt_at: Timestamp,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, PointsError>;

    /// Move an event to the DLQ: snapshot row inserted, event marked `dlq`.
    async fn move_event_to_dlq(&self, entry: DlqEntry) -> Result<(), PointsError>;

    async fn get_dlq_entry(&self, event_id: &str) -> Result<Option<DlqEntry>, PointsError>;

    async fn list_dlq_entries(
        &self,
        event_type: Option<&str>,
        replayable: Option<bool>,
        moved_after: Option<Timestamp>,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, PointsError>;

    /// Reset a DLQ'd event for replay: `status = queued`, `attempts = 0`,
    /// error fields cleared. Returns the reset event, or None if unknown.
    async fn reset_event_for_replay(
        &self,
        event_id: &str,
    ) -> Result<Option<IngestEvent>, PointsError>;

    /// Record a replay attempt on the DLQ entry.
    async fn record_dlq_replay(
        &self,
        event_id: &str,
        replayed_at: Timestamp,
        result: &str,
    ) -> Result<bool, PointsError>;
}

/// The full persistence surface. Services hold `Arc<dyn Store>` and use the
/// slice they need.
pub trait Store:
    WalletStore
    + EscrowStore
    + LedgerEntryStore
    + IdempotencyStore
    + ReservationStore
    + IngestStore
{
}

impl<T> Store for T where
    T: WalletStore
        + EscrowStore
        + LedgerEntryStore
        + IdempotencyStore
        + ReservationStore
        + IngestStore
{
}
