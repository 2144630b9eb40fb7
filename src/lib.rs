//! pointflow - Transactional loyalty-points ledger and escrow core
//!
//! The subsystem that authoritatively owns user and counterparty balances,
//! performs value movements under concurrency, and guarantees exactly-once
//! semantics for financial mutations.
//!
//! # Modules
//!
//! - [`core_types`] - Shared ids, balance buckets, entry types
//! - [`config`] - Service configuration
//! - [`error`] - Domain error taxonomy with stable codes
//! - [`validation`] - Hostile-input hardening for caller-supplied keys
//! - [`store`] - Storage traits plus in-memory and Postgres backends
//! - [`ledger`] - Append-only ledger: entries, queries, reconciliation
//! - [`idempotency`] - Composite-key dedup with stored-result replay
//! - [`wallet`] - Dual-balance wallets and the escrow lifecycle (OCC)
//! - [`authz`] - Capability tokens and role checks
//! - [`reservation`] - TTL-scoped holds with an expiry sweeper
//! - [`events`] - In-process bus and the balance snapshot cache
//! - [`ingest`] - Polled intake worker with retry backoff and DLQ
//! - [`app`] - Service graph wiring

pub mod app;
pub mod authz;
pub mod config;
pub mod core_types;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod ingest;
pub mod ledger;
pub mod logging;
pub mod reservation;
pub mod store;
pub mod validation;
pub mod wallet;

// Convenient re-exports at crate root
pub use app::PointsCore;
pub use config::AppConfig;
pub use core_types::{AccountType, BalanceState, EntryType, Points};
pub use error::PointsError;
pub use events::{EventBus, EventType, PointsEvent};
pub use idempotency::{EventScope, IdempotencyService};
pub use ledger::{LedgerEntry, LedgerFilter, LedgerService};
pub use store::{Store, memory::MemoryStore, postgres::PgStore};
pub use wallet::{EscrowStatus, WalletEngine};
