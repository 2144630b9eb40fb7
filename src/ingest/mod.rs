//! Async event intake: polled worker, retry backoff, dead-letter queue.

pub mod dlq;
pub mod handlers;
pub mod types;
pub mod worker;

pub use dlq::{DlqFilter, DlqService, ReplaySummary};
pub use handlers::{
    DefaultIngestHandler, HandlerOutcome, HandlerRegistry, IngestHandler, LedgerRepairHandler,
};
pub use types::{DlqEntry, IngestEvent, IngestStatus};
pub use worker::IngestWorker;
