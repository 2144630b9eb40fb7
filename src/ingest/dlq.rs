//! Dead-letter queue operations
//!
//! Replay is an explicit operator action: eligible entries are reset to
//! `queued` with a clean slate and picked up by the polling worker. The
//! per-event idempotency record makes replaying an event that already
//! succeeded a safe no-op.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core_types::{Timestamp, now};
use crate::error::PointsError;
use crate::ingest::types::DlqEntry;
use crate::store::Store;
use crate::validation::{MAX_IDENTIFIER_LEN, validate_identifier};

pub const REPLAY_RESULT_REQUEUED: &str = "requeued";
pub const REPLAY_RESULT_SKIPPED: &str = "skipped_not_replayable";

/// Selection criteria for listing and replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DlqFilter {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub replayable: Option<bool>,
    pub moved_after: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub matched: u64,
    pub requeued: u64,
    pub skipped: u64,
}

pub struct DlqService {
    store: Arc<dyn Store>,
}

impl DlqService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<DlqEntry>, PointsError> {
        let event_id = validate_identifier("event_id", event_id, MAX_IDENTIFIER_LEN)?;
        self.store.get_dlq_entry(&event_id).await
    }

    pub async fn list(&self, filter: &DlqFilter, limit: u32) -> Result<Vec<DlqEntry>, PointsError> {
        if let Some(ref event_id) = filter.event_id {
            let event_id = validate_identifier("event_id", event_id, MAX_IDENTIFIER_LEN)?;
            return Ok(self
                .store
                .get_dlq_entry(&event_id)
                .await?
                .into_iter()
                .collect());
        }
        self.store
            .list_dlq_entries(
                filter.event_type.as_deref(),
                filter.replayable,
                filter.moved_after,
                limit,
            )
            .await
    }

    /// Requeue up to `max_events` matching entries. Entries marked
    /// non-replayable are skipped unless `force` is set. Each attempt is
    /// recorded on the DLQ entry.
    pub async fn replay(
        &self,
        filter: &DlqFilter,
        max_events: u32,
        force: bool,
    ) -> Result<ReplaySummary, PointsError> {
        let entries = self.list(filter, max_events).await?;
        let mut summary = ReplaySummary {
            matched: entries.len() as u64,
            requeued: 0,
            skipped: 0,
        };

        for entry in entries {
            if !entry.replayable && !force {
                self.store
                    .record_dlq_replay(&entry.event_id, now(), REPLAY_RESULT_SKIPPED)
                    .await?;
                summary.skipped += 1;
                continue;
            }

            match self.store.reset_event_for_replay(&entry.event_id).await? {
                Some(_) => {
                    self.store
                        .record_dlq_replay(&entry.event_id, now(), REPLAY_RESULT_REQUEUED)
                        .await?;
                    info!(event_id = %entry.event_id, "DLQ event requeued for replay");
                    summary.requeued += 1;
                }
                None => {
                    // already replayed or never in DLQ state
                    summary.skipped += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{IngestEvent, IngestStatus};
    use crate::store::memory::MemoryStore;

    async fn seed_dlq(store: &Arc<dyn Store>, event_id: &str, replayable: bool) {
        let mut event =
            IngestEvent::queued(event_id.into(), "points.award".into(), serde_json::json!({}));
        event.replayable = replayable;
        store.enqueue_event(event.clone()).await.unwrap();
        store.claim_due_events(now(), 10).await.unwrap();
        store
            .move_event_to_dlq(DlqEntry::from_event(&event, "HANDLER_FAILED", "boom"))
            .await
            .unwrap();
    }

    fn service() -> (DlqService, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        (DlqService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_replay_requeues() {
        let (svc, store) = service();
        seed_dlq(&store, "evt-1", true).await;

        let summary = svc
            .replay(
                &DlqFilter {
                    event_id: Some("evt-1".into()),
                    ..Default::default()
                },
                10,
                false,
            )
            .await
            .unwrap();
        assert_eq!(summary.requeued, 1);

        let event = store.get_event("evt-1").await.unwrap().unwrap();
        assert_eq!(event.status, IngestStatus::Queued);
        assert_eq!(event.attempts, 0);

        let dlq = store.get_dlq_entry("evt-1").await.unwrap().unwrap();
        assert_eq!(dlq.replay_result.as_deref(), Some(REPLAY_RESULT_REQUEUED));
        assert!(dlq.replayed_at.is_some());
    }

    #[tokio::test]
    async fn test_non_replayable_skipped_unless_forced() {
        let (svc, store) = service();
        seed_dlq(&store, "evt-1", false).await;

        let filter = DlqFilter {
            event_id: Some("evt-1".into()),
            ..Default::default()
        };
        let summary = svc.replay(&filter, 10, false).await.unwrap();
        assert_eq!(summary.requeued, 0);
        assert_eq!(summary.skipped, 1);

        let summary = svc.replay(&filter, 10, true).await.unwrap();
        assert_eq!(summary.requeued, 1);
    }

    #[tokio::test]
    async fn test_second_replay_is_noop() {
        let (svc, store) = service();
        seed_dlq(&store, "evt-1", true).await;

        let filter = DlqFilter {
            event_id: Some("evt-1".into()),
            ..Default::default()
        };
        svc.replay(&filter, 10, false).await.unwrap();
        // event is back in queued; the DLQ entry remains but the event is
        // no longer resettable
        let summary = svc.replay(&filter, 10, false).await.unwrap();
        assert_eq!(summary.requeued, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (svc, store) = service();
        seed_dlq(&store, "evt-1", true).await;
        seed_dlq(&store, "evt-2", false).await;

        let all = svc.list(&DlqFilter::default(), 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let replayable = svc
            .list(
                &DlqFilter {
                    replayable: Some(true),
                    ..Default::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(replayable.len(), 1);
        assert_eq!(replayable[0].event_id, "evt-1");
    }
}
