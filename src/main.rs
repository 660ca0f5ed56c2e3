//! storeflow server entry point

use storeflow::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Event ingestion at /api/events
/// - Manual triggers, run inspection and cancellation under /api/*
/// - Live run status at /api/workflows/{id}/status
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::default();
    start_server(config).await
}
