//! Ingest event handlers
//!
//! Handlers are registered per event type; an unregistered type falls
//! through to the default handler. Outcomes drive the retry-vs-DLQ routing
//! in the worker, never surfacing as domain errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::ingest::types::IngestEvent;
use crate::ledger::entry::CreateEntryRequest;
use crate::ledger::service::LedgerService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// Transient failure; requeue with backoff until attempts run out.
    RetryableFailure(String),
    /// Permanent failure; straight to the DLQ.
    NonRetryableFailure(String),
}

#[async_trait]
pub trait IngestHandler: Send + Sync {
    async fn handle(&self, event: &IngestEvent) -> HandlerOutcome;
}

/// No-op success. Events with no registered handler are drained without
/// business effect.
pub struct DefaultIngestHandler;

#[async_trait]
impl IngestHandler for DefaultIngestHandler {
    async fn handle(&self, event: &IngestEvent) -> HandlerOutcome {
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "no handler registered, default no-op"
        );
        HandlerOutcome::Success
    }
}

/// Completion-repair for ledger entries whose write failed after a wallet
/// commit. The payload is the pending entry request; creation is idempotent
/// on its key, so re-running until success cannot double-post.
pub struct LedgerRepairHandler {
    ledger: Arc<LedgerService>,
}

impl LedgerRepairHandler {
    pub fn new(ledger: Arc<LedgerService>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl IngestHandler for LedgerRepairHandler {
    async fn handle(&self, event: &IngestEvent) -> HandlerOutcome {
        let request: CreateEntryRequest = match serde_json::from_value(event.payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                return HandlerOutcome::NonRetryableFailure(format!(
                    "repair payload malformed: {e}"
                ));
            }
        };

        match self.ledger.create_entry(request).await {
            Ok(entry) => {
                debug!(entry_id = %entry.entry_id, "repair entry landed");
                HandlerOutcome::Success
            }
            Err(e) if e.code() == "INVALID_INPUT" => {
                HandlerOutcome::NonRetryableFailure(e.to_string())
            }
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "repair write failed, will retry");
                HandlerOutcome::RetryableFailure(e.to_string())
            }
        }
    }
}

/// Handler lookup by event type.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn IngestHandler>>>,
    default: Arc<dyn IngestHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default: Arc::new(DefaultIngestHandler),
        }
    }

    pub async fn register(&self, event_type: &str, handler: Arc<dyn IngestHandler>) {
        self.handlers
            .write()
            .await
            .insert(event_type.to_string(), handler);
    }

    pub async fn resolve(&self, event_type: &str) -> Arc<dyn IngestHandler> {
        self.handlers
            .read()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHandler(HandlerOutcome);

    #[async_trait]
    impl IngestHandler for FixedHandler {
        async fn handle(&self, _event: &IngestEvent) -> HandlerOutcome {
            self.0.clone()
        }
    }

    fn event(event_type: &str) -> IngestEvent {
        IngestEvent::queued("evt-1".into(), event_type.into(), serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_default_handler_success() {
        let registry = HandlerRegistry::new();
        let handler = registry.resolve("unknown.type").await;
        assert_eq!(handler.handle(&event("unknown.type")).await, HandlerOutcome::Success);
    }

    #[tokio::test]
    async fn test_registered_handler_wins() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "points.award",
                Arc::new(FixedHandler(HandlerOutcome::RetryableFailure("x".into()))),
            )
            .await;

        let handler = registry.resolve("points.award").await;
        assert!(matches!(
            handler.handle(&event("points.award")).await,
            HandlerOutcome::RetryableFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_repair_handler_malformed_payload() {
        let store: Arc<crate::store::memory::MemoryStore> =
            Arc::new(crate::store::memory::MemoryStore::new());
        let ledger = Arc::new(LedgerService::new(store, "points".into()));
        let handler = LedgerRepairHandler::new(ledger);

        let mut e = event(crate::wallet::engine::LEDGER_REPAIR_EVENT_TYPE);
        e.payload = serde_json::json!({"not": "an entry"});
        assert!(matches!(
            handler.handle(&e).await,
            HandlerOutcome::NonRetryableFailure(_)
        ));
    }
}
