//! Slot Janitor
//!
//! Standalone process that periodically moves expired active slots to the expired
//! state, so capacity held by crashed callers comes back even when nobody is
//! acquiring in that scope. Runs until Ctrl-C.

use anyhow::Context;
use scenepipe_core::config::ConfigManager;
use scenepipe_core::database::{DatabaseConnection, PgStore};
use scenepipe_core::logging::{init_structured_logging, log_error};
use scenepipe_core::slot_broker::SlotBroker;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let manager = ConfigManager::load().context("loading configuration")?;
    let config = manager.config();
    info!(environment = %manager.environment(), "Starting slot janitor");

    let connection = DatabaseConnection::connect(&config.database)
        .await
        .context("connecting to database")?;
    let store = Arc::new(PgStore::new(connection.pool().clone()));
    let broker = SlotBroker::new(store, config.slot_broker.clone());

    let batch = config.slot_broker.purge_batch_size;
    let mut ticker = interval(config.slot_broker.purge_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match broker.purge_expired(batch).await {
                    Ok(expired) => debug!(expired = expired, "Purge pass finished"),
                    Err(e) => log_error("slot_janitor", "purge_expired", &e.to_string(), None),
                }
            }
            result = signal::ctrl_c() => {
                result.context("waiting for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    connection.close().await;
    info!("Slot janitor stopped");
    Ok(())
}
