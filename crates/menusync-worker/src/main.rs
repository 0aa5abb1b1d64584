use anyhow::{Context, Result};
use menusync_worker::{init_telemetry, AppConfig, Application, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    let _ = dotenvy::dotenv();

    init_telemetry(TelemetryConfig::from_env());

    tracing::info!("menusync-worker starting...");

    let config = AppConfig::from_env().context("Invalid configuration")?;

    tracing::info!(
        max_retries = config.max_retries,
        retry_unit_ms = config.retry_unit.as_millis() as u64,
        prefetch = config.prefetch_count,
        "Starting workers"
    );

    let app = Application::bootstrap(&config)
        .await
        .context("Failed to start application")?;
    app.start().await.context("Failed to start workers")?;

    let health = app.health().await;
    tracing::info!(
        broker_reachable = health.broker_reachable,
        store_reachable = health.store_reachable,
        "Workers running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    app.shutdown().await;
    Ok(())
}
