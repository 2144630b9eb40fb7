//! Balance snapshot cache
//!
//! Read-through convenience fed by wallet events at high priority. Never
//! authoritative: consumers that need correctness fall through to the
//! ledger. LRU bounded and TTL'd, so a stale read is a miss, not a wrong
//! answer.

use std::sync::Mutex;

use cached::stores::TimedSizedCache;
use cached::Cached;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BalanceCacheConfig;
use crate::core_types::{AccountType, Points};
use crate::events::bus::EventHandler;
use crate::events::{EventPayload, PointsEvent};

/// Priority the cache subscribes at. Low number runs before ordinary
/// consumers so they observe fresh snapshots.
pub const CACHE_SUBSCRIPTION_PRIORITY: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBalance {
    pub available: Option<Points>,
    pub escrow: Option<Points>,
    pub earned: Option<Points>,
    pub last_updated: DateTime<Utc>,
    /// Monotonic per-entry counter, local to this process.
    pub version: u64,
}

pub struct BalanceCache {
    cache: Mutex<TimedSizedCache<(AccountType, String), CachedBalance>>,
}

impl BalanceCache {
    pub fn new(config: &BalanceCacheConfig) -> Self {
        Self {
            cache: Mutex::new(TimedSizedCache::with_size_and_lifespan(
                config.max_entries,
                config.ttl_seconds,
            )),
        }
    }

    pub fn get(&self, account_type: AccountType, account_id: &str) -> Option<CachedBalance> {
        let mut cache = self.cache.lock().unwrap();
        cache
            .cache_get(&(account_type, account_id.to_string()))
            .cloned()
    }

    fn put(
        &self,
        account_type: AccountType,
        account_id: &str,
        available: Option<Points>,
        escrow: Option<Points>,
        earned: Option<Points>,
    ) {
        let key = (account_type, account_id.to_string());
        let mut cache = self.cache.lock().unwrap();
        let version = cache
            .cache_get(&key)
            .map(|prev| prev.version + 1)
            .unwrap_or(1);
        cache.cache_set(
            key,
            CachedBalance {
                available,
                escrow,
                earned,
                last_updated: Utc::now(),
                version,
            },
        );
    }

    /// Merge an earned-balance update without clobbering user buckets.
    fn put_model(&self, model_id: &str, earned: Points) {
        self.put(AccountType::Model, model_id, None, None, Some(earned));
    }

    fn put_user(&self, user_id: &str, available: Points, escrow: Points) {
        self.put(
            AccountType::User,
            user_id,
            Some(available),
            Some(escrow),
            None,
        );
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().cache_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalidate(&self, account_type: AccountType, account_id: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.cache_remove(&(account_type, account_id.to_string()));
    }
}

#[async_trait::async_trait]
impl EventHandler for BalanceCache {
    fn id(&self) -> &str {
        "balance_snapshot_cache"
    }

    async fn handle(&self, event: &PointsEvent) -> anyhow::Result<()> {
        match &event.payload {
            EventPayload::BalanceUpdated {
                user_id,
                available,
                escrow,
                ..
            } => self.put_user(user_id, *available, *escrow),
            EventPayload::EscrowHeld {
                user_id,
                user_available,
                user_escrow,
                ..
            }
            | EventPayload::EscrowRefunded {
                user_id,
                user_available,
                user_escrow,
                ..
            } => self.put_user(user_id, *user_available, *user_escrow),
            EventPayload::EscrowSettled {
                user_id,
                model_id,
                user_escrow,
                model_earned,
                ..
            } => {
                // escrow moved out; available is whatever we knew last
                let available = self
                    .get(AccountType::User, user_id)
                    .and_then(|c| c.available)
                    .unwrap_or(0);
                self.put_user(user_id, available, *user_escrow);
                self.put_model(model_id, *model_earned);
            }
            EventPayload::EscrowPartialSettled {
                user_id,
                model_id,
                user_available,
                user_escrow,
                model_earned,
                ..
            } => {
                self.put_user(user_id, *user_available, *user_escrow);
                self.put_model(model_id, *model_earned);
            }
            EventPayload::LedgerEntryCreated { .. } => {
                debug!(event_id = %event.event_id, "ledger event ignored by balance cache");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> BalanceCache {
        BalanceCache::new(&BalanceCacheConfig::default())
    }

    fn held_event(user_id: &str, available: Points, escrow: Points) -> PointsEvent {
        PointsEvent::new(
            "test",
            uuid::Uuid::new_v4().to_string(),
            EventPayload::EscrowHeld {
                user_id: user_id.into(),
                escrow_id: "esc_1".into(),
                queue_item_id: "q1".into(),
                amount: escrow,
                user_available: available,
                user_escrow: escrow,
                transaction_id: "txn_1".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache();
        assert!(cache.get(AccountType::User, "u1").is_none());

        cache.handle(&held_event("u1", 900, 100)).await.unwrap();
        let entry = cache.get(AccountType::User, "u1").unwrap();
        assert_eq!(entry.available, Some(900));
        assert_eq!(entry.escrow, Some(100));
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_version_monotonic() {
        let cache = cache();
        cache.handle(&held_event("u1", 900, 100)).await.unwrap();
        cache.handle(&held_event("u1", 800, 200)).await.unwrap();
        let entry = cache.get(AccountType::User, "u1").unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.available, Some(800));
    }

    #[tokio::test]
    async fn test_settled_updates_both_sides() {
        let cache = cache();
        cache.handle(&held_event("u1", 900, 100)).await.unwrap();

        let settled = PointsEvent::new(
            "test",
            uuid::Uuid::new_v4().to_string(),
            EventPayload::EscrowSettled {
                user_id: "u1".into(),
                model_id: "m1".into(),
                escrow_id: "esc_1".into(),
                queue_item_id: "q1".into(),
                amount: 100,
                user_escrow: 0,
                model_earned: 100,
                transaction_id: "txn_2".into(),
            },
        );
        cache.handle(&settled).await.unwrap();

        let user = cache.get(AccountType::User, "u1").unwrap();
        assert_eq!(user.available, Some(900));
        assert_eq!(user.escrow, Some(0));
        let model = cache.get(AccountType::Model, "m1").unwrap();
        assert_eq!(model.earned, Some(100));
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let config = BalanceCacheConfig {
            max_entries: 2,
            ttl_seconds: 3600,
        };
        let cache = BalanceCache::new(&config);
        cache.handle(&held_event("u1", 1, 0)).await.unwrap();
        cache.handle(&held_event("u2", 2, 0)).await.unwrap();
        cache.handle(&held_event("u3", 3, 0)).await.unwrap();

        assert!(cache.len() <= 2);
        assert!(cache.get(AccountType::User, "u3").is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_reads_as_miss() {
        let config = BalanceCacheConfig {
            max_entries: 10,
            ttl_seconds: 0,
        };
        let cache = BalanceCache::new(&config);
        cache.handle(&held_event("u1", 900, 100)).await.unwrap();
        assert!(cache.get(AccountType::User, "u1").is_none());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = cache();
        cache.handle(&held_event("u1", 900, 100)).await.unwrap();
        cache.invalidate(AccountType::User, "u1");
        assert!(cache.get(AccountType::User, "u1").is_none());
    }
}
