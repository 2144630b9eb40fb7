//! Polled ingest worker
//!
//! At-least-once intake with atomic claim, per-event idempotency, bounded
//! exponential backoff, and DLQ routing. Many workers may poll the same
//! store; the claim update is the mutual exclusion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::IngestConfig;
use crate::core_types::now;
use crate::error::PointsError;
use crate::idempotency::{EventScope, IdempotencyService};
use crate::ingest::handlers::{HandlerOutcome, HandlerRegistry};
use crate::ingest::types::{DlqEntry, IngestEvent};
use crate::store::Store;
use crate::validation::{MAX_IDENTIFIER_LEN, validate_identifier};

pub const INVALID_EVENT_CODE: &str = "INVALID_EVENT";
pub const HANDLER_FAILED_CODE: &str = "HANDLER_FAILED";
pub const RETRIES_EXHAUSTED_CODE: &str = "RETRIES_EXHAUSTED";

pub struct IngestWorker {
    store: Arc<dyn Store>,
    /// Keyed by event id under scope `ingest_event`; validated as an
    /// identifier, not a UUID.
    idempotency: Arc<IdempotencyService>,
    registry: Arc<HandlerRegistry>,
    config: IngestConfig,
    running: Arc<AtomicBool>,
}

impl IngestWorker {
    pub fn new(
        store: Arc<dyn Store>,
        idempotency: Arc<IdempotencyService>,
        registry: Arc<HandlerRegistry>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            idempotency,
            registry,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Accept an inbound event. The id is validated before any store
    /// access; a duplicate id is a no-op returning false.
    pub async fn submit(
        &self,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<bool, PointsError> {
        let event_id = validate_identifier("event_id", event_id, MAX_IDENTIFIER_LEN)?;
        let event_type = event_type.trim();
        if event_type.is_empty() {
            return Err(PointsError::InvalidInput(
                "event_type must be a non-empty string".into(),
            ));
        }

        let accepted = self
            .store
            .enqueue_event(IngestEvent::queued(
                event_id.clone(),
                event_type.to_string(),
                payload,
            ))
            .await?;
        if !accepted {
            info!(event_id = %event_id, "event already queued, ignoring");
        }
        Ok(accepted)
    }

    /// Spawn the poll loop. `stop()` prevents new batches; in-flight
    /// handlers run to completion.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let worker = self;
        tokio::spawn(async move {
            info!(
                poll_interval_ms = worker.config.poll_interval_ms,
                max_concurrent_jobs = worker.config.max_concurrent_jobs,
                "ingest worker started"
            );
            while worker.running.load(Ordering::SeqCst) {
                match worker.run_once().await {
                    Ok(0) => {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            worker.config.poll_interval_ms,
                        ))
                        .await;
                    }
                    Ok(_) => {} // drained a batch; poll again immediately
                    Err(e) => {
                        error!(error = %e, "ingest poll failed");
                        tokio::time::sleep(std::time::Duration::from_millis(
                            worker.config.poll_interval_ms,
                        ))
                        .await;
                    }
                }
            }
            info!("ingest worker stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim and process one batch. Returns how many events were claimed.
    pub async fn run_once(&self) -> Result<usize, PointsError> {
        let claimed = self
            .store
            .claim_due_events(now(), self.config.max_concurrent_jobs)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let count = claimed.len();
        let results = join_all(claimed.into_iter().map(|event| self.process(event))).await;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "event processing failed at the store layer");
            }
        }
        Ok(count)
    }

    async fn process(&self, event: IngestEvent) -> Result<(), PointsError> {
        // structural validation: non-empty id, object payload
        if event.event_id.trim().is_empty() || !event.payload.is_object() {
            warn!(event_id = %event.event_id, "malformed event, moving to DLQ");
            let mut snapshot = event.clone();
            snapshot.replayable = false;
            self.store
                .move_event_to_dlq(DlqEntry::from_event(
                    &snapshot,
                    INVALID_EVENT_CODE,
                    "event failed structural validation",
                ))
                .await?;
            return Ok(());
        }

        // per-event idempotency: a replay of something that already
        // succeeded is marked processed with no business effect
        let check = self
            .idempotency
            .check(&event.event_id, EventScope::IngestEvent)
            .await?;
        if check.is_duplicate {
            info!(event_id = %event.event_id, "event already processed, skipping");
            self.store.mark_event_processed(&event.event_id).await?;
            return Ok(());
        }

        let handler = self.registry.resolve(&event.event_type).await;
        match handler.handle(&event).await {
            HandlerOutcome::Success => {
                self.store.mark_event_processed(&event.event_id).await?;
                self.idempotency
                    .store(
                        &event.event_id,
                        EventScope::IngestEvent,
                        serde_json::json!({"processed": true}),
                        200,
                        None,
                    )
                    .await?;
                info!(event_id = %event.event_id, event_type = %event.event_type, "event processed");
            }
            HandlerOutcome::RetryableFailure(message) => {
                if event.attempts < self.config.max_retry_attempts {
                    let delay = self.retry_delay(event.attempts);
                    warn!(
                        event_id = %event.event_id,
                        attempts = event.attempts,
                        delay_ms = delay.num_milliseconds(),
                        error = %message,
                        "retryable failure, requeueing"
                    );
                    self.store
                        .requeue_event(
                            &event.event_id,
                            now() + delay,
                            HANDLER_FAILED_CODE,
                            &message,
                        )
                        .await?;
                } else {
                    warn!(
                        event_id = %event.event_id,
                        attempts = event.attempts,
                        "retries exhausted, moving to DLQ"
                    );
                    self.store
                        .move_event_to_dlq(DlqEntry::from_event(
                            &event,
                            RETRIES_EXHAUSTED_CODE,
                            &message,
                        ))
                        .await?;
                }
            }
            HandlerOutcome::NonRetryableFailure(message) => {
                warn!(
                    event_id = %event.event_id,
                    error = %message,
                    "non-retryable failure, moving to DLQ"
                );
                self.store
                    .move_event_to_dlq(DlqEntry::from_event(&event, HANDLER_FAILED_CODE, &message))
                    .await?;
            }
        }
        Ok(())
    }

    /// Exponential backoff: initial * multiplier^(attempts-1), capped.
    fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let raw = self
            .config
            .initial_retry_delay_ms
            .saturating_mul((self.config.retry_backoff_multiplier as u64).pow(exponent));
        Duration::milliseconds(raw.min(self.config.max_retry_delay_ms) as i64)
    }
}
