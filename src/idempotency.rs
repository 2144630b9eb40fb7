//! Composite-key idempotency
//!
//! Records are keyed by `(key, scope)`: the same client key may legally
//! appear under different scopes (a reserve/commit pair can share one id).
//! Creation races resolve deterministically: the first writer wins and
//! losers read the winner's stored result.
//!
//! Two horizons per record: `expires_at` bounds operational replay of the
//! stored result; `retention_until` bounds how long the row exists at all,
//! for audit. A record past `expires_at` but inside retention still answers
//! "duplicate" without replaying the stored payload.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::IdempotencyConfig;
use crate::error::PointsError;
use crate::store::IdempotencyStore;
use crate::validation::{IdempotencyKey, KeyValidator};

/// Operation families that scope idempotency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Reserve,
    Commit,
    Release,
    Award,
    Deduct,
    Webhook,
    HoldEscrow,
    SettleEscrow,
    RefundEscrow,
    PartialSettleEscrow,
    IngestEvent,
}

impl EventScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventScope::Reserve => "reserve",
            EventScope::Commit => "commit",
            EventScope::Release => "release",
            EventScope::Award => "award",
            EventScope::Deduct => "deduct",
            EventScope::Webhook => "webhook",
            EventScope::HoldEscrow => "hold_escrow",
            EventScope::SettleEscrow => "settle_escrow",
            EventScope::RefundEscrow => "refund_escrow",
            EventScope::PartialSettleEscrow => "partial_settle_escrow",
            EventScope::IngestEvent => "ingest_event",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "reserve" => Some(EventScope::Reserve),
            "commit" => Some(EventScope::Commit),
            "release" => Some(EventScope::Release),
            "award" => Some(EventScope::Award),
            "deduct" => Some(EventScope::Deduct),
            "webhook" => Some(EventScope::Webhook),
            "hold_escrow" => Some(EventScope::HoldEscrow),
            "settle_escrow" => Some(EventScope::SettleEscrow),
            "refund_escrow" => Some(EventScope::RefundEscrow),
            "partial_settle_escrow" => Some(EventScope::PartialSettleEscrow),
            "ingest_event" => Some(EventScope::IngestEvent),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted idempotency record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub scope: EventScope,
    /// md5 fingerprint of the stored result, for cheap divergence checks.
    pub result_hash: String,
    pub stored_result: serde_json::Value,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retention_until: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_replayable(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Outcome of a duplicate check.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyCheck {
    pub is_duplicate: bool,
    /// Present only while the record is operationally replayable.
    pub stored_result: Option<serde_json::Value>,
    pub status_code: Option<u16>,
    pub original_timestamp: Option<DateTime<Utc>>,
}

impl IdempotencyCheck {
    pub fn miss() -> Self {
        Self {
            is_duplicate: false,
            stored_result: None,
            status_code: None,
            original_timestamp: None,
        }
    }
}

pub fn result_hash(result: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(result).unwrap_or_default();
    hex::encode(md5::compute(&bytes).0)
}

/// Idempotency service over a pluggable store.
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
    validator: KeyValidator,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            validator: crate::validation::is_uuid_v4,
        }
    }

    /// Substitute a stricter key validator than the UUID v4 default.
    pub fn with_validator(mut self, validator: KeyValidator) -> Self {
        self.validator = validator;
        self
    }

    fn parse_key(&self, key: &str) -> Result<IdempotencyKey, PointsError> {
        IdempotencyKey::with_validator(key, self.validator)
    }

    /// Look up `(key, scope)`. Expired-but-retained rows report duplicate
    /// without a replayable result.
    pub async fn check(
        &self,
        key: &str,
        scope: EventScope,
    ) -> Result<IdempotencyCheck, PointsError> {
        let key = self.parse_key(key)?;
        let now = Utc::now();

        match self.store.get_idempotency(key.as_str(), scope).await? {
            None => Ok(IdempotencyCheck::miss()),
            Some(record) if record.is_replayable(now) => {
                debug!(key = %key, scope = %scope, "idempotency hit, replaying stored result");
                Ok(IdempotencyCheck {
                    is_duplicate: true,
                    stored_result: Some(record.stored_result),
                    status_code: Some(record.status_code),
                    original_timestamp: Some(record.created_at),
                })
            }
            Some(record) => Ok(IdempotencyCheck {
                is_duplicate: true,
                stored_result: None,
                status_code: None,
                original_timestamp: Some(record.created_at),
            }),
        }
    }

    /// Store a result under `(key, scope)`. Colliding with an existing
    /// record is a no-op: the first writer wins.
    pub async fn store(
        &self,
        key: &str,
        scope: EventScope,
        result: serde_json::Value,
        status_code: u16,
        ttl_seconds: Option<u64>,
    ) -> Result<(), PointsError> {
        let key = self.parse_key(key)?;
        let now = Utc::now();
        let ttl = ttl_seconds.unwrap_or(self.config.ttl_seconds);

        let record = IdempotencyRecord {
            key: key.into_string(),
            scope,
            result_hash: result_hash(&result),
            stored_result: result,
            status_code,
            created_at: now,
            expires_at: now + Duration::seconds(ttl as i64),
            retention_until: now + Duration::seconds(self.config.retention_seconds as i64),
        };

        if let Some(existing) = self.store.put_idempotency_if_absent(record).await? {
            debug!(
                key = %existing.key,
                scope = %scope,
                "idempotency store race lost, keeping first writer"
            );
        }
        Ok(())
    }
}
