//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by every test in the binary. Each test
//! gets its own database inside it, so workers in one test never claim rows
//! written by another.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use taskq::jobs::{ClientConfig, PostgresTaskStore, TaskClient, WorkerConfig};
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    server_url: String,
    admin_pool: PgPool,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=taskq=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=300"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let server_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        let admin_pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&format!("{server_url}/postgres"))
            .await
            .context("Failed to connect to Postgres")?;

        Ok(Self {
            server_url,
            admin_pool,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test database with the queue schema applied.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let client = ctx.client();
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    pub store: Arc<PostgresTaskStore>,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let database = format!("taskq_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE {database}"))
            .execute(&infra.admin_pool)
            .await
            .context("Failed to create test database")?;

        let db_pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(&format!("{}/{}", infra.server_url, database))
            .await
            .context("Failed to connect to test database")?;

        let store = Arc::new(PostgresTaskStore::new(db_pool.clone()));
        store.migrate().await.context("Failed to run migrations")?;

        Ok(Self { db_pool, store })
    }

    pub fn client(&self) -> TaskClient {
        TaskClient::with_config(
            self.store.clone(),
            ClientConfig {
                result_poll_interval: Duration::from_millis(20),
                ..ClientConfig::default()
            },
        )
    }

    /// Worker settings tuned for tests: fast polling, short heartbeat.
    pub fn worker_config(&self, worker_id: &str) -> WorkerConfig {
        WorkerConfig {
            worker_id: worker_id.to_string(),
            concurrency: 1,
            poll_interval: Duration::from_millis(20),
            poll_jitter: Duration::from_millis(10),
            heartbeat_interval: Some(Duration::from_millis(200)),
            max_store_backoff: Duration::from_millis(200),
        }
    }

    /// Move a task's schedule into the past so it is eligible now.
    pub async fn make_eligible(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE tasks SET not_before = NOW() - INTERVAL '1 second' WHERE id = $1")
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    /// Age a running row's lock as if its worker stopped heartbeating.
    pub async fn age_lock(&self, id: Uuid, by: Duration) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET locked_at = locked_at - ($2 || ' milliseconds')::INTERVAL WHERE id = $1",
        )
        .bind(id)
        .bind(by.as_millis().to_string())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }
}
