use anyhow::{Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{ClientConfig, WorkerConfig};

/// Queue configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    /// Zero disables heartbeats
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub default_max_retries: i32,
    pub default_priority: i32,
    pub result_poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: var_or("TASKQ_MAX_CONNECTIONS", 10)?,
            concurrency: var_or("TASKQ_CONCURRENCY", 4)?,
            poll_interval: Duration::from_millis(var_or("TASKQ_POLL_INTERVAL_MS", 1000)?),
            poll_jitter: Duration::from_millis(var_or("TASKQ_POLL_JITTER_MS", 250)?),
            heartbeat_interval: Duration::from_secs(var_or("TASKQ_HEARTBEAT_SECS", 30)?),
            stale_after: Duration::from_secs(var_or("TASKQ_STALE_AFTER_SECS", 300)?),
            default_max_retries: var_or("TASKQ_DEFAULT_MAX_RETRIES", 3)?,
            default_priority: var_or("TASKQ_DEFAULT_PRIORITY", 0)?,
            result_poll_interval: Duration::from_millis(var_or("TASKQ_RESULT_POLL_MS", 100)?),
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.concurrency > 0, "TASKQ_CONCURRENCY must be at least 1");
        anyhow::ensure!(
            self.default_max_retries >= 0,
            "TASKQ_DEFAULT_MAX_RETRIES must not be negative"
        );
        anyhow::ensure!(
            self.heartbeat_interval.is_zero() || self.stale_after > self.heartbeat_interval * 2,
            "TASKQ_STALE_AFTER_SECS must exceed twice TASKQ_HEARTBEAT_SECS"
        );
        Ok(())
    }

    /// Worker settings; the worker id is generated per process.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            poll_jitter: self.poll_jitter,
            heartbeat_interval: (!self.heartbeat_interval.is_zero())
                .then_some(self.heartbeat_interval),
            ..WorkerConfig::default()
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            default_priority: self.default_priority,
            default_max_retries: self.default_max_retries,
            result_poll_interval: self.result_poll_interval,
        }
    }

    /// Open the connection pool.
    pub async fn connect(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&self.database_url)
            .await
            .context("failed to connect to DATABASE_URL")
    }
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
