//! Reservation expiry sweeper
//!
//! Background loop that expires overdue `active` reservations and restores
//! their balances, plus TTL eviction of long-dead terminal rows. Stop is
//! cooperative: the flag is checked at loop boundaries and in-flight work
//! runs to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ReservationConfig;
use crate::core_types::now;
use crate::error::PointsError;
use crate::reservation::service::ReservationService;
use crate::store::Store;

const SWEEP_BATCH: u32 = 100;

pub struct ReservationSweeper {
    service: Arc<ReservationService>,
    store: Arc<dyn Store>,
    config: ReservationConfig,
    running: Arc<AtomicBool>,
}

impl ReservationSweeper {
    pub fn new(
        service: Arc<ReservationService>,
        store: Arc<dyn Store>,
        config: ReservationConfig,
    ) -> Self {
        Self {
            service,
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the sweep loop. Returns the task handle; call `stop()` to shut
    /// down at the next loop boundary.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let sweeper = self;
        tokio::spawn(async move {
            info!(
                interval_ms = sweeper.config.sweep_interval_ms,
                "reservation sweeper started"
            );
            while sweeper.running.load(Ordering::SeqCst) {
                if let Err(e) = sweeper.sweep_once().await {
                    error!(error = %e, "reservation sweep failed");
                }
                tokio::time::sleep(std::time::Duration::from_millis(
                    sweeper.config.sweep_interval_ms,
                ))
                .await;
            }
            info!("reservation sweeper stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One pass: expire what is overdue, purge what is long dead. Public so
    /// tests can drive the sweep deterministically.
    pub async fn sweep_once(&self) -> Result<u64, PointsError> {
        let now_ts = now();
        let due = self
            .store
            .find_expired_reservations(now_ts, SWEEP_BATCH)
            .await?;

        let mut expired = 0u64;
        for reservation in &due {
            // CAS inside expire(): a concurrent commit/release wins cleanly
            if self.service.expire(reservation).await? {
                expired += 1;
            }
        }

        let cutoff = now_ts - Duration::seconds(self.config.purge_after_seconds as i64);
        let purged = self.store.purge_reservations_before(cutoff).await?;
        if expired > 0 || purged > 0 {
            info!(expired, purged, "reservation sweep complete");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdempotencyConfig, WalletConfig};
    use crate::idempotency::IdempotencyService;
    use crate::ledger::service::LedgerService;
    use crate::reservation::ReservationStatus;
    use crate::store::memory::MemoryStore;
    use crate::wallet::models::Wallet;

    fn fixture() -> (Arc<ReservationSweeper>, Arc<ReservationService>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(LedgerService::new(store.clone(), "points".into()));
        let idempotency = Arc::new(IdempotencyService::new(
            store.clone(),
            IdempotencyConfig::default(),
        ));
        let config = ReservationConfig {
            default_ttl_seconds: 300,
            sweep_interval_ms: 10,
            purge_after_seconds: 3600,
        };
        let service = Arc::new(ReservationService::new(
            store.clone(),
            ledger,
            idempotency,
            WalletConfig {
                max_retry_attempts: 3,
                retry_backoff_ms: 1,
            },
            config.clone(),
        ));
        let sweeper = Arc::new(ReservationSweeper::new(
            service.clone(),
            store.clone(),
            config,
        ));
        (sweeper, service, store)
    }

    async fn fund(store: &Arc<dyn Store>, user_id: &str, amount: u64) {
        let mut w = Wallet::new(user_id.to_string());
        w.credit(amount).unwrap();
        store.create_wallet_if_absent(w).await.unwrap();
    }

    fn uuid() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[tokio::test]
    async fn test_sweep_expires_and_restores() {
        let (sweeper, service, store) = fixture();
        fund(&store, "u1", 1000).await;

        let r = service.reserve("u1", 100, Some(0), &uuid()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let expired = sweeper.sweep_once().await.unwrap();
        assert_eq!(expired, 1);

        let wallet = store.get_wallet("u1").await.unwrap().unwrap();
        assert_eq!(wallet.available(), 1000);

        let reservation = service.get(&r.reservation_id).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Expired);
    }

    #[tokio::test]
    async fn test_sweep_skips_active_and_terminal() {
        let (sweeper, service, store) = fixture();
        fund(&store, "u1", 1000).await;

        // long TTL: not due
        service.reserve("u1", 100, Some(300), &uuid()).await.unwrap();
        // already released
        let r = service.reserve("u1", 50, Some(0), &uuid()).await.unwrap();
        store
            .transition_reservation(
                &r.reservation_id,
                ReservationStatus::Released,
                now(),
                None,
            )
            .await
            .unwrap();

        let expired = sweeper.sweep_once().await.unwrap();
        assert_eq!(expired, 0);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (sweeper, _, _) = fixture();
        let handle = sweeper.clone().start();
        assert!(sweeper.is_running());
        sweeper.stop();
        // loop observes the flag at its next boundary
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
