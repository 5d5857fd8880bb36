use std::sync::Arc;
use std::time::Duration;

use subscriptions_engine::clock::SystemClock;
use subscriptions_engine::config::Settings;
use subscriptions_engine::gateways::GatewayRegistry;
use subscriptions_engine::notify::TracingNotifier;
use subscriptions_engine::storage::Database;
use subscriptions_engine::storage::time::UtcTimer;
use subscriptions_engine::{EngineState, SubscriptionEngine};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(UtcTimer)
        .init();

    let settings = Settings::load()?;
    let database = Database::new(&settings.database.path).await?;
    let poll_interval = Duration::from_secs(settings.worker.poll_interval_secs.max(1));
    let batch_size = settings.worker.batch_size;

    // Gateways are registered by the host process. Standalone, automatic renewals fail to charge.
    let gateways = GatewayRegistry::new();
    let state = EngineState::from_database(
        database,
        settings,
        gateways,
        Arc::new(TracingNotifier),
        Arc::new(SystemClock),
    )?;
    let engine = SubscriptionEngine::new(state);

    if std::env::args().any(|a| a == "--migrate-retries") {
        let progress = engine.migrate_retries().await?;
        tracing::info!(migrated = progress.migrated, cursor = progress.cursor, "retry migration finished");
        return Ok(());
    }

    tracing::info!(interval_secs = poll_interval.as_secs(), batch_size, "renewal worker started");
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.run_due_actions(batch_size).await {
                    tracing::error!("failed to run due actions: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down renewal worker");
                break;
            }
        }
    }

    Ok(())
}
