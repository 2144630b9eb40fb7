//! Ingest event and DLQ records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Queued,
    Processing,
    Processed,
    Rejected,
    Dlq,
}

impl IngestStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestStatus::Processed | IngestStatus::Rejected | IngestStatus::Dlq
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Queued => "queued",
            IngestStatus::Processing => "processing",
            IngestStatus::Processed => "processed",
            IngestStatus::Rejected => "rejected",
            IngestStatus::Dlq => "dlq",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(IngestStatus::Queued),
            "processing" => Some(IngestStatus::Processing),
            "processed" => Some(IngestStatus::Processed),
            "rejected" => Some(IngestStatus::Rejected),
            "dlq" => Some(IngestStatus::Dlq),
            _ => None,
        }
    }
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One queued intake event. Claimed atomically by the worker; terminates in
/// `processed`, `rejected` (validation failure, no retry) or `dlq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub status: IngestStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Snapshot of the inbound payload, replayed as-is.
    pub payload: serde_json::Value,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub replayable: bool,
    pub received_at: DateTime<Utc>,
}

impl IngestEvent {
    pub fn queued(event_id: EventId, event_type: String, payload: serde_json::Value) -> Self {
        Self {
            event_id,
            event_type,
            status: IngestStatus::Queued,
            attempts: 0,
            next_attempt_at: None,
            payload,
            last_error_code: None,
            last_error_message: None,
            replayable: true,
            received_at: Utc::now(),
        }
    }
}

/// Terminal snapshot of an event that exhausted retries or failed
/// non-retryably. Replay is an explicit operator action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqEntry {
    pub event_id: EventId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_error_code: String,
    pub last_error_message: String,
    pub moved_to_dlq_at: DateTime<Utc>,
    pub replayable: bool,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replay_result: Option<String>,
}

impl DlqEntry {
    pub fn from_event(event: &IngestEvent, error_code: &str, error_message: &str) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            attempts: event.attempts,
            last_error_code: error_code.to_string(),
            last_error_message: error_message.to_string(),
            moved_to_dlq_at: Utc::now(),
            replayable: event.replayable,
            replayed_at: None,
            replay_result: None,
        }
    }
}
