//! Application wiring
//!
//! Builds the full service graph over a chosen store, connects the balance
//! cache to the bus, registers the ledger repair handler, and manages the
//! background loops (ingest poll, reservation sweep, dedup cleaner). Pure
//! orchestration; no business decisions live here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::authz::capability::QueueAuthorizer;
use crate::config::AppConfig;
use crate::events::balance_cache::{BalanceCache, CACHE_SUBSCRIPTION_PRIORITY};
use crate::events::bus::EventBus;
use crate::events::EventType;
use crate::idempotency::IdempotencyService;
use crate::ingest::dlq::DlqService;
use crate::ingest::handlers::{HandlerRegistry, LedgerRepairHandler};
use crate::ingest::worker::IngestWorker;
use crate::ledger::service::LedgerService;
use crate::reservation::service::ReservationService;
use crate::reservation::sweeper::ReservationSweeper;
use crate::store::memory::MemoryStore;
use crate::store::Store;
use crate::validation::is_safe_identifier;
use crate::wallet::engine::{LEDGER_REPAIR_EVENT_TYPE, WalletEngine};

const WALLET_EVENT_TYPES: [EventType; 5] = [
    EventType::BalanceUpdated,
    EventType::EscrowHeld,
    EventType::EscrowSettled,
    EventType::EscrowRefunded,
    EventType::EscrowPartialSettled,
];

pub struct PointsCore {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub ledger: Arc<LedgerService>,
    pub idempotency: Arc<IdempotencyService>,
    pub bus: Arc<EventBus>,
    pub balance_cache: Arc<BalanceCache>,
    pub engine: Arc<WalletEngine>,
    pub reservations: Arc<ReservationService>,
    pub sweeper: Arc<ReservationSweeper>,
    pub ingest_worker: Arc<IngestWorker>,
    pub handler_registry: Arc<HandlerRegistry>,
    pub dlq: Arc<DlqService>,
    pub authorizer: Arc<QueueAuthorizer>,
    dedup_cleaner_running: Arc<AtomicBool>,
}

impl PointsCore {
    pub async fn new(config: AppConfig, store: Arc<dyn Store>) -> Self {
        let bus = Arc::new(EventBus::new(config.events.clone()));
        let ledger = Arc::new(
            LedgerService::new(store.clone(), config.service.default_currency.clone())
                .with_bus(bus.clone()),
        );
        let idempotency = Arc::new(IdempotencyService::new(
            store.clone(),
            config.idempotency.clone(),
        ));
        let authorizer = Arc::new(QueueAuthorizer::new(&config.authz));

        let balance_cache = Arc::new(BalanceCache::new(&config.balance_cache));
        bus.subscribe(
            &WALLET_EVENT_TYPES,
            balance_cache.clone(),
            CACHE_SUBSCRIPTION_PRIORITY,
        )
        .await;

        let engine = Arc::new(WalletEngine::new(
            store.clone(),
            ledger.clone(),
            idempotency.clone(),
            bus.clone(),
            authorizer.clone(),
            config.wallet.clone(),
        ));

        let reservations = Arc::new(ReservationService::new(
            store.clone(),
            ledger.clone(),
            idempotency.clone(),
            config.wallet.clone(),
            config.reservations.clone(),
        ));
        let sweeper = Arc::new(ReservationSweeper::new(
            reservations.clone(),
            store.clone(),
            config.reservations.clone(),
        ));

        let handler_registry = Arc::new(HandlerRegistry::new());
        handler_registry
            .register(
                LEDGER_REPAIR_EVENT_TYPE,
                Arc::new(LedgerRepairHandler::new(ledger.clone())),
            )
            .await;

        // event ids are identifiers, not UUIDs
        let ingest_idempotency = Arc::new(
            IdempotencyService::new(store.clone(), config.idempotency.clone())
                .with_validator(is_safe_identifier),
        );
        let ingest_worker = Arc::new(IngestWorker::new(
            store.clone(),
            ingest_idempotency,
            handler_registry.clone(),
            config.ingest.clone(),
        ));

        let dlq = Arc::new(DlqService::new(store.clone()));

        Self {
            config,
            store,
            ledger,
            idempotency,
            bus,
            balance_cache,
            engine,
            reservations,
            sweeper,
            ingest_worker,
            handler_registry,
            dlq,
            authorizer,
            dedup_cleaner_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Full graph over the in-memory store. Dev mode and tests.
    pub async fn in_memory(config: AppConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new())).await
    }

    /// Launch the background loops. Handles run until `stop_background`.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.ingest_worker.clone().start(),
            self.sweeper.clone().start(),
        ];
        handles.push(self.start_maintenance_loop());
        info!("background loops started");
        handles
    }

    /// Cooperative shutdown: loops observe their flag at the next boundary
    /// and in-flight operations run to completion.
    pub fn stop_background(&self) {
        self.ingest_worker.stop();
        self.sweeper.stop();
        self.dedup_cleaner_running.store(false, Ordering::SeqCst);
        info!("background loops stopping");
    }

    /// Periodic maintenance: sweep the event dedup cache and drop
    /// idempotency rows past their compliance retention horizon.
    fn start_maintenance_loop(&self) -> JoinHandle<()> {
        self.dedup_cleaner_running.store(true, Ordering::SeqCst);
        let running = self.dedup_cleaner_running.clone();
        let bus = self.bus.clone();
        let store = self.store.clone();
        let interval = self.config.events.dedup_sweep_interval_seconds;
        tokio::spawn(async move {
            // tick every second so stop is observed promptly
            let mut elapsed = 0u64;
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                elapsed += 1;
                if elapsed >= interval.max(1) {
                    elapsed = 0;
                    let swept = bus.sweep_dedup();
                    if swept > 0 {
                        info!(swept, "event dedup cache swept");
                    }
                    match store
                        .purge_idempotency_past_retention(crate::core_types::now())
                        .await
                    {
                        Ok(purged) if purged > 0 => {
                            info!(purged, "idempotency records past retention purged");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "idempotency purge failed"),
                    }
                }
            }
        })
    }
}
