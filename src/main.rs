use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otpboard::{
    api::{self, AppState},
    config::Config,
    scheduler::SystemClock,
    store::{JsonFileBackend, SecretStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter().into()),
        )
        .with_target(false)
        .init();

    let backend = JsonFileBackend::new(&config.data_file);
    let store = SecretStore::open(backend)
        .with_context(|| format!("Failed to open data file {}", config.data_file.display()))?;

    let state = AppState::new(Arc::new(store), Arc::new(SystemClock), config.max_image_bytes);
    let app = api::router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(%addr, data_file = %config.data_file.display(), "otpboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
