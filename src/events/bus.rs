//! In-process publish/subscribe
//!
//! Handlers are ordered by ascending priority within each event type and
//! invoked with bounded retry. One handler's failure never affects another;
//! its final failure is reported in the publish result. Publishing
//! short-circuits when either the event id or the idempotency key was seen
//! inside the dedup window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::EventBusConfig;
use crate::events::{EventType, PointsEvent};

/// Event consumer. Implementations must be bounded; the bus applies retry,
/// not timeouts.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    fn id(&self) -> &str;
    async fn handle(&self, event: &PointsEvent) -> anyhow::Result<()>;
}

/// A handler that exhausted its retries for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler_id: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub event_id: String,
    pub success: bool,
    pub handlers_notified: usize,
    pub errors: Vec<HandlerFailure>,
    /// True when the dedup window swallowed the publish.
    pub deduplicated: bool,
}

/// How `publish_with_mode` runs the handler fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Await every handler before returning.
    #[default]
    Sync,
    /// Schedule the fan-out and return immediately.
    Spawn,
}

struct Subscription {
    id: String,
    priority: u32,
    handler: Arc<dyn EventHandler>,
}

pub struct EventBus {
    subscriptions: RwLock<FxHashMap<EventType, Vec<Subscription>>>,
    /// Seen event ids and idempotency keys, with first-seen time.
    dedup: DashMap<String, DateTime<Utc>>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            subscriptions: RwLock::new(FxHashMap::default()),
            dedup: DashMap::new(),
            config,
        }
    }

    /// Register a handler for a set of event types. Idempotent per
    /// `(handler id, event type)`: re-subscribing replaces the previous
    /// registration and priority.
    pub async fn subscribe(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
        priority: u32,
    ) {
        let mut subs = self.subscriptions.write().await;
        for event_type in event_types {
            let list = subs.entry(*event_type).or_default();
            list.retain(|s| s.id != handler.id());
            list.push(Subscription {
                id: handler.id().to_string(),
                priority,
                handler: handler.clone(),
            });
            list.sort_by_key(|s| s.priority);
        }
    }

    pub async fn unsubscribe(&self, handler_id: &str, event_types: &[EventType]) {
        let mut subs = self.subscriptions.write().await;
        for event_type in event_types {
            if let Some(list) = subs.get_mut(event_type) {
                list.retain(|s| s.id != handler_id);
            }
        }
    }

    /// Publish synchronously: all handlers run (with retry) before return.
    pub async fn publish(&self, event: PointsEvent) -> PublishResult {
        self.publish_with_mode(event, PublishMode::Sync).await
    }

    pub async fn publish_with_mode(&self, event: PointsEvent, mode: PublishMode) -> PublishResult {
        if self.is_duplicate(&event) {
            debug!(event_id = %event.event_id, "publish deduplicated");
            return PublishResult {
                event_id: event.event_id,
                success: true,
                handlers_notified: 0,
                errors: Vec::new(),
                deduplicated: true,
            };
        }

        let handlers = self.handlers_for(event.event_type).await;
        match mode {
            PublishMode::Sync => Self::run_handlers(handlers, self.config.clone(), event).await,
            PublishMode::Spawn => {
                let event_id = event.event_id.clone();
                let config = self.config.clone();
                tokio::spawn(async move {
                    let result = Self::run_handlers(handlers, config, event).await;
                    if !result.success {
                        error!(
                            event_id = %result.event_id,
                            failed = result.errors.len(),
                            "detached publish had handler failures"
                        );
                    }
                });
                PublishResult {
                    event_id,
                    success: true,
                    handlers_notified: 0,
                    errors: Vec::new(),
                    deduplicated: false,
                }
            }
        }
    }

    /// Check-and-mark against the dedup window. Either key match within the
    /// window short-circuits the publish.
    fn is_duplicate(&self, event: &PointsEvent) -> bool {
        let now = Utc::now();
        let window = Duration::seconds(self.config.dedup_ttl_seconds as i64);

        let fresh = |seen: &DateTime<Utc>| now.signed_duration_since(*seen) < window;

        let seen_event = self
            .dedup
            .get(&event.event_id)
            .is_some_and(|t| fresh(t.value()));
        let seen_key = !event.idempotency_key.is_empty()
            && self
                .dedup
                .get(&event.idempotency_key)
                .is_some_and(|t| fresh(t.value()));
        if seen_event || seen_key {
            return true;
        }

        self.dedup.insert(event.event_id.clone(), now);
        if !event.idempotency_key.is_empty() {
            self.dedup.insert(event.idempotency_key.clone(), now);
        }
        false
    }

    /// Snapshot the subscriber list for one event type, priority order.
    async fn handlers_for(&self, event_type: EventType) -> Vec<(String, Arc<dyn EventHandler>)> {
        let subs = self.subscriptions.read().await;
        subs.get(&event_type)
            .map(|list| {
                list.iter()
                    .map(|s| (s.id.clone(), s.handler.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn run_handlers(
        handlers: Vec<(String, Arc<dyn EventHandler>)>,
        config: EventBusConfig,
        event: PointsEvent,
    ) -> PublishResult {
        let mut errors = Vec::new();
        for (id, handler) in &handlers {
            if let Some(failure) =
                Self::invoke_with_retry(&config, id, handler.as_ref(), &event).await
            {
                errors.push(failure);
            }
        }

        PublishResult {
            event_id: event.event_id,
            success: errors.is_empty(),
            handlers_notified: handlers.len(),
            errors,
            deduplicated: false,
        }
    }

    /// Run one handler with bounded retry. Returns its final failure, if
    /// any.
    async fn invoke_with_retry(
        config: &EventBusConfig,
        handler_id: &str,
        handler: &dyn EventHandler,
        event: &PointsEvent,
    ) -> Option<HandlerFailure> {
        let attempts = config.handler_retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match handler.handle(event).await {
                Ok(()) => return None,
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        handler_id = %handler_id,
                        event_id = %event.event_id,
                        attempt,
                        error = %last_error,
                        "event handler failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            config.handler_retry_delay_ms,
                        ))
                        .await;
                    }
                }
            }
        }

        Some(HandlerFailure {
            handler_id: handler_id.to_string(),
            error: last_error,
            attempts,
        })
    }

    /// Drop dedup records older than the window. Called by the periodic
    /// cleaner.
    pub fn sweep_dedup(&self) -> usize {
        let now = Utc::now();
        let window = Duration::seconds(self.config.dedup_ttl_seconds as i64);
        let before = self.dedup.len();
        self.dedup
            .retain(|_, seen| now.signed_duration_since(*seen) < window);
        before - self.dedup.len()
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }
}
