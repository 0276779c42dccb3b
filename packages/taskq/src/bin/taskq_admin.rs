//! Operator CLI for the task queue
//!
//! Prints JSON on stdout; logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use taskq::jobs::{PostgresTaskStore, Reaper, TaskClient, TaskStore};
use taskq::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "taskq-admin")]
#[command(about = "Inspect and maintain the task queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply schema migrations
    Migrate,

    /// Per-status counts and eligible backlog
    Stats,

    /// Return rows held by unresponsive workers to the queue
    Reap {
        /// Lock age after which a running row is considered orphaned
        #[arg(long)]
        stale_after_secs: Option<u64>,
        /// Keep reaping at this interval until interrupted
        #[arg(long)]
        every_secs: Option<u64>,
    },

    /// Show a task record
    Status { id: Uuid },

    /// Cancel a pending task
    Cancel { id: Uuid },
}

#[derive(Serialize)]
struct CancelResponse {
    id: Uuid,
    cancelled: bool,
}

fn output<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskq=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    let pool = config.connect().await?;
    let store = Arc::new(PostgresTaskStore::new(pool));

    match cli.command {
        Commands::Migrate => {
            store.migrate().await.context("Failed to run migrations")?;
            output(&serde_json::json!({ "migrated": true }))
        }
        Commands::Stats => output(&store.stats().await?),
        Commands::Reap {
            stale_after_secs,
            every_secs,
        } => {
            let stale_after = stale_after_secs
                .map(Duration::from_secs)
                .unwrap_or(config.stale_after);
            let reaper = Reaper::new(store, stale_after);

            match every_secs {
                None => output(&reaper.reap_once().await?),
                Some(every) => {
                    let shutdown = CancellationToken::new();
                    let trigger = shutdown.clone();
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            trigger.cancel();
                        }
                    });
                    reaper
                        .run(Duration::from_secs(every.max(1)), shutdown)
                        .await?;
                    Ok(())
                }
            }
        }
        Commands::Status { id } => {
            let client = TaskClient::with_config(store, config.client_config());
            output(&client.get(id).await?)
        }
        Commands::Cancel { id } => {
            let client = TaskClient::with_config(store, config.client_config());
            let cancelled = client.cancel(id).await?;
            output(&CancelResponse { id, cancelled })
        }
    }
}
