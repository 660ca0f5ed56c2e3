//! Server setup and initialization
//!
//! Wires together all components: store, graph registry, action registry,
//! executor, router, schedule poller and HTTP routes.

use crate::{
    api::{self, AppState},
    config::Config,
    runtime::{
        ActionRegistry, GraphExecutor, ScheduledTriggerPoller, SqliteSleeper, StatusBus,
        TriggerRouter,
    },
    workflow::{GraphRegistry, SqliteStore, WorkflowStore},
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Fully wired engine components
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<SqliteStore>,
    pub graphs: Arc<GraphRegistry>,
    pub executor: Arc<GraphExecutor>,
    pub router: Arc<TriggerRouter>,
    pub poller: Arc<ScheduledTriggerPoller>,
    pub status: StatusBus,
}

/// Open the database and build every engine component (the poller is not started)
pub async fn build_engine(config: &Config) -> Result<Engine> {
    ensure_database_dir(&config.database.url)?;

    tracing::info!("📋 Opening workflow store: {}", config.database.url);
    let store = Arc::new(
        SqliteStore::connect(&config.database.url)
            .await
            .context("failed to open workflow store")?,
    );
    let dyn_store: Arc<dyn WorkflowStore> = store.clone();

    tracing::info!("📊 Initializing graph registry and action handlers");
    let graphs = Arc::new(GraphRegistry::new());
    let actions = Arc::new(ActionRegistry::with_builtin_handlers());
    tracing::debug!("🧩 Actions: {:?}", actions);

    let status = StatusBus::new(config.engine.status_channel_capacity);
    let sleeper = Arc::new(SqliteSleeper::new(store.pool().clone()));

    tracing::info!("🚀 Initializing graph executor");
    let executor = Arc::new(
        GraphExecutor::new(
            Arc::clone(&dyn_store),
            Arc::clone(&graphs),
            actions,
            sleeper,
            Arc::new(status.clone()),
        )
        .with_max_node_visits(config.engine.max_node_visits),
    );

    let router = Arc::new(TriggerRouter::new(
        Arc::clone(&dyn_store),
        Arc::clone(&executor),
        config.engine.workspace_concurrency,
    ));

    let poller = Arc::new(ScheduledTriggerPoller::new(
        dyn_store,
        Arc::clone(&router),
        config.engine.poll_interval(),
    ));

    Ok(Engine {
        store,
        graphs,
        executor,
        router,
        poller,
        status,
    })
}

/// HTTP routes for a built engine
pub fn app(engine: &Engine) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(api::routes().with_state(AppState::from(engine)))
}

/// Create the main Axum application, resume interrupted runs and start the schedule poller
pub async fn create_app(config: Config) -> Result<(Router, Engine)> {
    let engine = build_engine(&config).await?;

    let resumed = engine
        .router
        .resume_interrupted()
        .await
        .context("failed to resume interrupted runs")?;
    if !resumed.is_empty() {
        tracing::info!("♻️ Resumed {} interrupted run(s)", resumed.len());
    }

    tracing::info!("⏰ Starting schedule poller");
    engine
        .poller
        .start()
        .await
        .context("failed to start schedule poller")?;

    tracing::info!("✅ Application initialized successfully");
    Ok((app(&engine), engine))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting storeflow server...");

    let (app, engine) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.poller.stop().await?;
    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}

/// Create the directory of a file-backed SQLite URL
fn ensure_database_dir(url: &str) -> Result<()> {
    let Some(path) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring data directory exists: {}", parent.display());
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
