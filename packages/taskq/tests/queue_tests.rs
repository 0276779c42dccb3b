//! Integration tests for the PostgreSQL task store, worker and client.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::TestHarness;
use serde_json::{json, Value};
use taskq::jobs::{
    EnqueueOptions, ErrorKind, Outcome, QueueStats, ReapReport, Reaper, RetryPolicy, Task,
    TaskClient, TaskRegistry, TaskStatus, TaskStore, TaskWorker,
};
use taskq::QueueError;
use test_context::test_context;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WAIT: Option<Duration> = Some(Duration::from_secs(30));

fn echo_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register("echo", RetryPolicy::default(), |task| async move {
            task.arg::<Value>(0)
        })
        .unwrap();
    registry
}

/// Counts claims that actually handed out a row.
struct CountingStore<S> {
    inner: S,
    claims: AtomicU64,
}

impl<S> CountingStore<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            claims: AtomicU64::new(0),
        }
    }

    fn claims(&self) -> u64 {
        self.claims.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for CountingStore<S> {
    async fn insert(
        &self,
        task: &Task,
        not_before: Option<chrono::DateTime<chrono::Utc>>,
    ) -> taskq::Result<Option<Task>> {
        self.inner.insert(task, not_before).await
    }

    async fn get(&self, id: Uuid) -> taskq::Result<Option<Task>> {
        self.inner.get(id).await
    }

    async fn claim(&self, worker_id: &str, skip_names: &[String]) -> taskq::Result<Option<Task>> {
        let claimed = self.inner.claim(worker_id, skip_names).await?;
        if claimed.is_some() {
            self.claims.fetch_add(1, Ordering::SeqCst);
        }
        Ok(claimed)
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        worker_id: &str,
        outcome: Outcome,
    ) -> taskq::Result<bool> {
        self.inner.record_outcome(id, worker_id, outcome).await
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> taskq::Result<bool> {
        self.inner.release(id, worker_id).await
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str) -> taskq::Result<bool> {
        self.inner.heartbeat(id, worker_id).await
    }

    async fn cancel(&self, id: Uuid) -> taskq::Result<bool> {
        self.inner.cancel(id).await
    }

    async fn reap_stale(&self, stale_after: Duration) -> taskq::Result<ReapReport> {
        self.inner.reap_stale(stale_after).await
    }

    async fn stats(&self) -> taskq::Result<QueueStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// Claim protocol
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_claims_hand_out_each_row_once(ctx: &TestHarness) {
    let client = ctx.client();
    for n in 0..50 {
        client
            .enqueue("echo", [n], (), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let claimers: Vec<_> = (0..20)
        .map(|i| {
            let store = ctx.store.clone();
            tokio::spawn(async move {
                let worker_id = format!("claimer-{i}");
                let mut claimed = Vec::new();
                while let Some(task) = store.claim(&worker_id, &[]).await.unwrap() {
                    assert_eq!(task.locked_by.as_deref(), Some(worker_id.as_str()));
                    claimed.push(task.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);

    let stats = ctx.store.stats().await.unwrap();
    assert_eq!(stats.running, 50);
    assert_eq!(stats.pending, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn claims_follow_priority(ctx: &TestHarness) {
    let client = ctx.client();
    let not_before = chrono::Utc::now() - chrono::Duration::seconds(1);

    for priority in [1, 5, 3] {
        let options = EnqueueOptions::builder()
            .priority(priority)
            .not_before(not_before)
            .build();
        client
            .enqueue("echo", [priority], (), options)
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(task) = ctx.store.claim("w", &[]).await.unwrap() {
        order.push(task.priority);
    }
    assert_eq!(order, vec![5, 3, 1]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn ties_break_on_id(ctx: &TestHarness) {
    let client = ctx.client();
    let not_before = chrono::Utc::now() - chrono::Duration::seconds(1);

    let mut ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        let options = EnqueueOptions::builder()
            .id(*id)
            .not_before(not_before)
            .build();
        client.enqueue("echo", [1], (), options).await.unwrap();
    }
    ids.sort();

    let mut order = Vec::new();
    while let Some(task) = ctx.store.claim("w", &[]).await.unwrap() {
        order.push(task.id);
    }
    assert_eq!(order, ids);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn future_tasks_are_not_claimed(ctx: &TestHarness) {
    let client = ctx.client();
    let options = EnqueueOptions::builder()
        .not_before(chrono::Utc::now() + chrono::Duration::hours(1))
        .build();
    let handle = client.enqueue("echo", [1], (), options).await.unwrap();

    assert!(ctx.store.claim("w", &[]).await.unwrap().is_none());

    ctx.make_eligible(handle.id()).await.unwrap();
    assert!(ctx.store.claim("w", &[]).await.unwrap().is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_id_writes_one_row(ctx: &TestHarness) {
    let client = ctx.client();
    let id = Uuid::new_v4();
    let options = EnqueueOptions::builder().id(id).build();

    let first = client
        .enqueue("echo", ["first"], (), options.clone())
        .await
        .unwrap();
    let second = client
        .enqueue("echo", ["second"], (), options)
        .await
        .unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(client.get(id).await.unwrap().args, json!(["first"]));
    assert_eq!(ctx.store.stats().await.unwrap().total(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn nul_payload_is_rejected_before_insert(ctx: &TestHarness) {
    let client = ctx.client();

    let err = client
        .enqueue("scrape", ["a\u{0}b"], (), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)), "got {err:?}");
    assert_eq!(ctx.store.stats().await.unwrap().total(), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn default_schedule_comes_from_database_clock(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("echo", [1], (), EnqueueOptions::default())
        .await
        .unwrap();

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.not_before, task.created_at);
    assert_eq!(ctx.store.claim("w", &[]).await.unwrap().unwrap().id, handle.id());
}

// ============================================================================
// Worker outcomes
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn echo_result_round_trip(ctx: &TestHarness) {
    let client = ctx.client();
    let shutdown = CancellationToken::new();
    let worker = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(echo_registry()),
        ctx.worker_config("echo-worker"),
    );
    let running = tokio::spawn(worker.run(shutdown.clone()));

    let handle = client
        .enqueue("echo", [42], (), EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(client.get_result(handle.id(), WAIT).await.unwrap(), json!(42));

    shutdown.cancel();
    running.await.unwrap().unwrap();

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.attempt_count, 1);
    assert!(task.locked_by.is_none());
    assert!(task.locked_at.is_none());
    assert!(task.error.is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn failing_task_backs_off_then_fails(ctx: &TestHarness) {
    let client = ctx.client();
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "flaky",
            RetryPolicy::exponential(3, Duration::from_secs(1), 2.0),
            |_task| async move { Err::<(), _>(anyhow::anyhow!("upstream unavailable")) },
        )
        .unwrap();
    let worker = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(registry),
        ctx.worker_config("flaky-worker"),
    );

    let handle = client
        .enqueue(
            "flaky",
            json!([]),
            (),
            EnqueueOptions::builder().max_retries(3).build(),
        )
        .await
        .unwrap();

    let mut gaps = Vec::new();
    for attempt in 1..=3 {
        assert!(worker.run_once().await.unwrap());

        let task = client.get(handle.id()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, attempt);
        gaps.push(task.not_before - task.updated_at);

        assert!(!worker.run_once().await.unwrap());
        ctx.make_eligible(handle.id()).await.unwrap();
    }

    assert_eq!(
        gaps,
        vec![
            chrono::Duration::seconds(1),
            chrono::Duration::seconds(2),
            chrono::Duration::seconds(4),
        ]
    );

    assert!(worker.run_once().await.unwrap());
    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.attempt_count, 4);
    assert!(task.result.is_none());

    let error = task.task_error().unwrap();
    assert_eq!(error.kind, ErrorKind::Retryable);
    assert_eq!(error.attempt, 4);
    assert_eq!(error.worker.as_deref(), Some("flaky-worker/0"));

    // Exhausted rows are never claimed again
    assert!(!worker.run_once().await.unwrap());
    match client.get_result(handle.id(), WAIT).await {
        Err(QueueError::TaskFailed { error, .. }) => assert_eq!(error.message, "upstream unavailable"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn retry_never_moves_not_before_backwards(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("echo", [1], (), EnqueueOptions::default())
        .await
        .unwrap();
    ctx.store.claim("w", &[]).await.unwrap().unwrap();

    // A row already scheduled far ahead keeps its later time
    sqlx::query("UPDATE tasks SET not_before = NOW() + INTERVAL '2 hours' WHERE id = $1")
        .bind(handle.id())
        .execute(&ctx.db_pool)
        .await
        .unwrap();
    let before = client.get(handle.id()).await.unwrap().not_before;

    let applied = ctx
        .store
        .record_outcome(
            handle.id(),
            "w",
            Outcome::Retry {
                delay: Duration::from_secs(1),
            },
        )
        .await
        .unwrap();
    assert!(applied);

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.not_before, before);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unstorable_result_is_recorded_as_failure(ctx: &TestHarness) {
    let client = ctx.client();
    let mut registry = TaskRegistry::new();
    registry
        .register("scrape", RetryPolicy::default(), |_task| async move {
            Ok("page text\u{0}with nul")
        })
        .unwrap();
    let worker = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(registry),
        ctx.worker_config("scraper"),
    );

    let handle = client
        .enqueue("scrape", json!([]), (), EnqueueOptions::default())
        .await
        .unwrap();
    assert!(worker.run_once().await.unwrap());

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.attempt_count, 1);
    assert!(task.locked_by.is_none());
    assert!(task.result.is_none());

    let error = task.task_error().unwrap();
    assert_eq!(error.kind, ErrorKind::NonRetryable);
    assert!(error.message.starts_with("result could not be stored"));

    match client.get_result(handle.id(), WAIT).await.unwrap_err() {
        QueueError::TaskFailed { id, .. } => assert_eq!(id, handle.id()),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn uncapped_backoff_is_clamped_to_storable_delay(ctx: &TestHarness) {
    let client = ctx.client();
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "flaky",
            RetryPolicy::exponential(100, Duration::from_secs(1), 10.0),
            |_task| async move { Err::<(), _>(anyhow::anyhow!("still down")) },
        )
        .unwrap();
    let worker = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(registry),
        ctx.worker_config("flaky-worker"),
    );

    let handle = client
        .enqueue(
            "flaky",
            json!([]),
            (),
            EnqueueOptions::builder().max_retries(100).build(),
        )
        .await
        .unwrap();
    sqlx::query("UPDATE tasks SET attempt_count = 19 WHERE id = $1")
        .bind(handle.id())
        .execute(&ctx.db_pool)
        .await
        .unwrap();

    assert!(worker.run_once().await.unwrap());

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 20);
    assert!(task.locked_by.is_none());
    assert!(task.not_before > task.updated_at + chrono::Duration::days(365 * 99));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unregistered_task_is_released_for_another_worker(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("resize_image", ["a.png"], (), EnqueueOptions::default())
        .await
        .unwrap();

    let echo_only = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(echo_registry()),
        ctx.worker_config("echo-only"),
    );
    assert!(echo_only.run_once().await.unwrap());

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 0);
    assert!(task.locked_by.is_none());

    let mut registry = TaskRegistry::new();
    registry
        .register("resize_image", RetryPolicy::default(), |task| async move {
            let path: String = task.arg(0)?;
            Ok(format!("thumb-{path}"))
        })
        .unwrap();
    let resizer = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(registry),
        ctx.worker_config("resizer"),
    );
    assert!(resizer.run_once().await.unwrap());

    assert_eq!(
        client.get_result(handle.id(), WAIT).await.unwrap(),
        json!("thumb-a.png")
    );
    assert_eq!(client.get(handle.id()).await.unwrap().attempt_count, 1);
}

// ============================================================================
// Cancellation and terminal states
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn cancelled_task_is_never_claimed(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("echo", [1], (), EnqueueOptions::default())
        .await
        .unwrap();

    assert!(client.cancel(handle.id()).await.unwrap());
    assert_eq!(
        client.get_status(handle.id()).await.unwrap(),
        TaskStatus::Cancelled
    );
    assert!(ctx.store.claim("w", &[]).await.unwrap().is_none());
    assert!(!client.cancel(handle.id()).await.unwrap());
    assert!(matches!(
        client.get_result(handle.id(), WAIT).await,
        Err(QueueError::Cancelled(_))
    ));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn running_task_cannot_be_cancelled(ctx: &TestHarness) {
    let client = ctx.client();
    let release = Arc::new(Notify::new());

    let mut registry = TaskRegistry::new();
    let gate = release.clone();
    registry
        .register("gated", RetryPolicy::default(), move |_task| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok("done")
            }
        })
        .unwrap();

    let shutdown = CancellationToken::new();
    let worker = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(registry),
        ctx.worker_config("gated-worker"),
    );
    let running = tokio::spawn(worker.run(shutdown.clone()));

    let handle = client
        .enqueue("gated", json!([]), (), EnqueueOptions::default())
        .await
        .unwrap();

    while client.get_status(handle.id()).await.unwrap() != TaskStatus::Running {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!client.cancel(handle.id()).await.unwrap());
    release.notify_one();

    assert_eq!(
        client.get_result(handle.id(), WAIT).await.unwrap(),
        json!("done")
    );

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
async fn terminal_state_is_stable(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("echo", ["stable"], (), EnqueueOptions::default())
        .await
        .unwrap();

    let task = ctx.store.claim("w1", &[]).await.unwrap().unwrap();
    assert!(ctx
        .store
        .record_outcome(task.id, "w1", Outcome::Success(json!("stable")))
        .await
        .unwrap());

    // No further claim, no overwrite by a stale holder
    assert!(ctx.store.claim("w2", &[]).await.unwrap().is_none());
    assert!(!ctx
        .store
        .record_outcome(task.id, "w1", Outcome::Success(json!("changed")))
        .await
        .unwrap());
    assert!(!ctx.store.heartbeat(task.id, "w1").await.unwrap());

    let first = client.get_result(handle.id(), WAIT).await.unwrap();
    let second = client.get_result(handle.id(), WAIT).await.unwrap();
    assert_eq!(first, json!("stable"));
    assert_eq!(first, second);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn get_result_timeout_leaves_task_pending(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("echo", [1], (), EnqueueOptions::default())
        .await
        .unwrap();

    let err = client
        .get_result(handle.id(), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Timeout { .. }));
    assert_eq!(
        client.get_status(handle.id()).await.unwrap(),
        TaskStatus::Pending
    );
}

// ============================================================================
// Crash recovery
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn reaper_requeues_rows_of_dead_workers(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("echo", ["orphan"], (), EnqueueOptions::default())
        .await
        .unwrap();
    ctx.store.claim("dead/0", &[]).await.unwrap().unwrap();

    let reaper = Reaper::new(ctx.store.clone(), Duration::from_secs(60));
    assert!(reaper.reap_once().await.unwrap().is_empty());

    ctx.age_lock(handle.id(), Duration::from_secs(120))
        .await
        .unwrap();
    let report = reaper.reap_once().await.unwrap();
    assert_eq!(report.requeued, vec![handle.id()]);
    assert!(report.failed.is_empty());

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 1);
    assert!(task.locked_by.is_none());

    // The dead worker's late write is fenced out
    assert!(!ctx
        .store
        .record_outcome(handle.id(), "dead/0", Outcome::Success(json!("late")))
        .await
        .unwrap());

    let worker = TaskWorker::with_config(
        ctx.store.clone(),
        Arc::new(echo_registry()),
        ctx.worker_config("alive"),
    );
    assert!(worker.run_once().await.unwrap());
    assert_eq!(
        client.get_result(handle.id(), WAIT).await.unwrap(),
        json!("orphan")
    );
    assert_eq!(client.get(handle.id()).await.unwrap().attempt_count, 2);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn reaper_fails_rows_that_lost_their_last_attempt(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue(
            "echo",
            ["once"],
            (),
            EnqueueOptions::builder().max_retries(0).build(),
        )
        .await
        .unwrap();
    ctx.store.claim("dead/0", &[]).await.unwrap().unwrap();
    ctx.age_lock(handle.id(), Duration::from_secs(120))
        .await
        .unwrap();

    let report = Reaper::new(ctx.store.clone(), Duration::from_secs(60))
        .reap_once()
        .await
        .unwrap();
    assert_eq!(report.failed, vec![handle.id()]);

    let task = client.get(handle.id()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    let error = task.task_error().unwrap();
    assert_eq!(error.kind, ErrorKind::WorkerLost);
    assert_eq!(error.attempt, 1);
    assert_eq!(error.worker.as_deref(), Some("dead/0"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn heartbeat_refreshes_lock(ctx: &TestHarness) {
    let client = ctx.client();
    let handle = client
        .enqueue("echo", [1], (), EnqueueOptions::default())
        .await
        .unwrap();
    ctx.store.claim("w", &[]).await.unwrap().unwrap();
    ctx.age_lock(handle.id(), Duration::from_secs(120))
        .await
        .unwrap();

    assert!(ctx.store.heartbeat(handle.id(), "w").await.unwrap());
    assert!(!ctx.store.heartbeat(handle.id(), "other").await.unwrap());

    let report = Reaper::new(ctx.store.clone(), Duration::from_secs(60))
        .reap_once()
        .await
        .unwrap();
    assert!(report.is_empty());
}

// ============================================================================
// Throughput scenario
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn hundred_tasks_across_ten_workers(ctx: &TestHarness) {
    let store = Arc::new(CountingStore::new(ctx.store.as_ref().clone()));
    let client = TaskClient::new(store.clone());
    let shutdown = CancellationToken::new();

    // Every seventh task fails once so some rows take two claims
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "square",
            RetryPolicy::exponential(3, Duration::from_millis(50), 2.0),
            |task| async move {
                let n: i64 = task.arg(0)?;
                if n % 7 == 0 && task.attempt == 1 {
                    anyhow::bail!("transient failure for {n}");
                }
                Ok(n * n)
            },
        )
        .unwrap();
    let registry = Arc::new(registry);

    let mut ids = Vec::new();
    for n in 0..100i64 {
        let handle = client
            .enqueue("square", [n], (), EnqueueOptions::default())
            .await
            .unwrap();
        ids.push(handle.id());
    }

    let workers: Vec<_> = (0..10)
        .map(|i| {
            let mut config = ctx.worker_config(&format!("worker-{i}"));
            config.poll_interval = Duration::from_millis(50);
            let worker = TaskWorker::with_config(store.clone(), registry.clone(), config);
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect();

    for (n, id) in ids.iter().enumerate() {
        let value: i64 = client.get_result_as(*id, WAIT).await.unwrap();
        assert_eq!(value, (n * n) as i64);
    }
    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap().unwrap();
    }

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.terminal(), 100);
    assert_eq!(stats.success, 100);

    let (attempts,): (i64,) = sqlx::query_as("SELECT SUM(attempt_count)::BIGINT FROM tasks")
        .fetch_one(&ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(attempts as u64, store.claims());
    assert_eq!(attempts, 115);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn stats_report_backlog(ctx: &TestHarness) {
    let client = ctx.client();
    for n in 0..3 {
        client
            .enqueue("echo", [n], (), EnqueueOptions::default())
            .await
            .unwrap();
    }
    let later = EnqueueOptions::builder()
        .not_before(chrono::Utc::now() + chrono::Duration::hours(1))
        .build();
    client.enqueue("echo", [9], (), later).await.unwrap();
    let cancelled = client
        .enqueue("echo", [10], (), EnqueueOptions::default())
        .await
        .unwrap();
    client.cancel(cancelled.id()).await.unwrap();
    ctx.store.claim("w", &[]).await.unwrap().unwrap();

    let stats = ctx.store.stats().await.unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.eligible, 2);
    assert_eq!(stats.depth(), 4);
    assert!(stats.oldest_eligible_at.is_some());
}
