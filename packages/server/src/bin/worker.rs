// Worker entry point: one user's session runtime inside the per-user
// deployment. Exits 0 on clean idle shutdown, non-zero on startup errors.

use std::sync::Arc;

use anyhow::{Context, Result};
use pgbus::MessageBus;
use server_core::worker::WorkerSession;
use server_core::WorkerConfig;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    tracing::info!(
        user_id = %config.user_id,
        deployment = %config.deployment_name,
        "Starting worker session"
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let bus = MessageBus::new(pool);
    // Idempotent; covers workers racing a fresh control plane.
    bus.migrate().await.context("Failed to run bus migrations")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let session = Arc::new(WorkerSession::new(config, bus));
    session.run(shutdown).await?;

    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("received shutdown signal");
        shutdown.cancel();
    });
}
