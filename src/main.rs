//! pointflow service entry point
//!
//! Loads configuration, connects the store, wires the service graph, and
//! runs the background loops until shutdown. Transport layers (HTTP,
//! message consumers) sit in front of this core and are deliberately not
//! part of it.

use std::sync::Arc;

use tracing::info;

use pointflow::app::PointsCore;
use pointflow::config::AppConfig;
use pointflow::store::Store;
use pointflow::store::postgres::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::from_env(),
    };

    let _log_guard = pointflow::logging::init_logging(&config.logging);
    info!(
        service = %config.service.name,
        git = env!("GIT_HASH"),
        "starting"
    );

    let store = PgStore::connect(&config.database).await?;
    store.init_schema().await?;
    info!("database schema ready");

    let store: Arc<dyn Store> = Arc::new(store);
    let core = PointsCore::new(config, store).await;
    let handles = core.start_background();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    core.stop_background();
    for handle in handles {
        // loops exit at their next boundary; in-flight work completes first
        let _ = handle.await;
    }
    info!("shutdown complete");
    Ok(())
}
