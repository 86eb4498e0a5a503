// Main entry point for the control plane: dispatcher HTTP surface,
// orchestrator, and response consumer in one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use pgbus::MessageBus;
use server_core::consumer::ResponseConsumer;
use server_core::orchestrator::Orchestrator;
use server_core::server::build_app;
use server_core::{Config, ServerDeps};
use slack::{SlackClient, SlackOptions};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting code-agent control plane");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    let bus = MessageBus::new(pool.clone());
    tracing::info!("Running bus migrations...");
    bus.migrate().await.context("Failed to run bus migrations")?;
    tracing::info!("Migrations complete");

    let slack = SlackClient::new(SlackOptions {
        bot_token: config.slack_bot_token.clone(),
        signing_secret: config.slack_signing_secret.clone(),
    })
    .context("Failed to create chat client")?;

    let port = config.port;
    let deps = ServerDeps::new(pool, bus, slack, config);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let orchestrator = Arc::new(Orchestrator::new(deps.clone(), kube_client));
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown.clone()));

    let consumer = Arc::new(ResponseConsumer::new(deps.clone()));
    let consumer_handle = tokio::spawn(consumer.run(shutdown.clone()));

    let app = build_app(deps);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Events endpoint: http://localhost:{}/events", port);
    tracing::info!("Health check: http://localhost:{}/health", port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Server error")?;

    shutdown.cancel();
    orchestrator_handle.await??;
    consumer_handle.await??;

    tracing::info!("Control plane stopped");
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
