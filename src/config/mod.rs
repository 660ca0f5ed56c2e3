//! Configuration management for the storeflow engine
//!
//! Handles server binding, database location and engine limits. Every value
//! can be overridden through `STOREFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Execution limits and cadences
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://data/storeflow.db`
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum in-flight runs per workspace; further runs queue
    pub workspace_concurrency: usize,
    /// Seconds between schedule poller ticks
    pub poll_interval_secs: u64,
    /// Node visits allowed per run before it is failed as runaway
    pub max_node_visits: usize,
    /// Buffered status events per subscriber
    pub status_channel_capacity: usize,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("STOREFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("STOREFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("STOREFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/storeflow.db".to_string()),
            },
            engine: EngineConfig {
                workspace_concurrency: env_or("STOREFLOW_WORKSPACE_CONCURRENCY", 5),
                poll_interval_secs: env_or("STOREFLOW_POLL_INTERVAL_SECS", 300),
                max_node_visits: env_or("STOREFLOW_MAX_NODE_VISITS", 1000),
                status_channel_capacity: env_or("STOREFLOW_STATUS_CHANNEL_CAPACITY", 1024),
            },
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
