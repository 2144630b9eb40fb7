//! Append-only ledger
//!
//! Records every balance change for complete auditability. Entries are
//! immutable after creation; corrections are equal-and-opposite appends,
//! never updates.

pub mod entry;
pub mod query;
pub mod reconciliation;
pub mod service;

pub use entry::{CreateEntryRequest, LedgerEntry, state_transition};
pub use query::{BalanceSnapshot, LedgerFilter, LedgerPage, SortField, SortOrder};
pub use reconciliation::ReconciliationReport;
pub use service::LedgerService;
