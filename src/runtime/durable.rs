//! Durable suspension for delay nodes
//!
//! A sleep is identified by a key. The first call for a key persists its wake
//! time; a call re-issued after a restart waits only for whatever is left of
//! it, and a key that already completed returns at once.

use crate::workflow::storage::{format_ts, parse_ts};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::time::Duration;

/// Suspend interface used by the delay handler
#[async_trait]
pub trait DurableSleeper: Send + Sync {
    /// Suspend for `duration`, measured from the first call with this key
    async fn sleep(&self, key: &str, duration: Duration) -> Result<()>;

    /// Suspend until `wake_at`
    async fn sleep_until(&self, key: &str, wake_at: DateTime<Utc>) -> Result<()>;
}

/// Sleeper backed by the `durable_sleeps` table
#[derive(Debug, Clone)]
pub struct SqliteSleeper {
    pool: SqlitePool,
}

impl SqliteSleeper {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register the key (first wake time wins) and return the stored state
    async fn register(&self, key: &str, wake_at: DateTime<Utc>) -> Result<(DateTime<Utc>, bool)> {
        sqlx::query(
            r#"
            INSERT INTO durable_sleeps (key, wake_at, completed, created_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(format_ts(wake_at))
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT wake_at, completed FROM durable_sleeps WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;

        let stored: String = row.try_get("wake_at")?;
        let completed: bool = row.try_get("completed")?;
        Ok((parse_ts(&stored)?, completed))
    }
}

#[async_trait]
impl DurableSleeper for SqliteSleeper {
    async fn sleep(&self, key: &str, duration: Duration) -> Result<()> {
        let delta = chrono::Duration::from_std(duration).context("sleep duration out of range")?;
        let wake_at = Utc::now()
            .checked_add_signed(delta)
            .context("sleep duration out of range")?;
        self.sleep_until(key, wake_at).await
    }

    async fn sleep_until(&self, key: &str, wake_at: DateTime<Utc>) -> Result<()> {
        let (wake_at, completed) = self.register(key, wake_at).await?;
        if completed {
            tracing::debug!(key, "⏭️ Durable sleep already completed");
            return Ok(());
        }

        let remaining = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(key, wake_at = %wake_at, ?remaining, "💤 Suspending");
        tokio::time::sleep(remaining).await;

        sqlx::query("UPDATE durable_sleeps SET completed = 1, completed_at = ? WHERE key = ?")
            .bind(format_ts(Utc::now()))
            .bind(key)
            .execute(&self.pool)
            .await?;

        tracing::debug!(key, "⏰ Durable sleep resumed");
        Ok(())
    }
}
