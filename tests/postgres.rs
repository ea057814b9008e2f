#![cfg(feature = "postgres")]
#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_err, assert_none, assert_ok, assert_some};
use dispatchq::{
    BackgroundJob, Enqueuer, JobStatus, JobStore, NotificationMode, PgStore, ProgressHandle,
    Runner, StoreError, Transport, setup_database,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the store
    /// and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgStore, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((PgStore::new(pool), container))
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn migrations_create_the_jobs_table() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name = 'jobs' AND table_schema = 'public'",
    )
    .fetch_one(store.pool())
    .await?;
    assert_eq!(table_count, 1);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn claim_is_atomic_across_concurrent_claimants() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let job = store.create("t", "default", json!({})).await?;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.claim_next("default", &format!("w{i}")).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if assert_ok!(task.await?).is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let claimed = store.get(job.id).await?;
    assert_eq!(claimed.status, JobStatus::Started);
    assert_some!(claimed.started_at);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn terminal_transitions_are_idempotent_per_outcome() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let job = store.create("t", "default", json!({})).await?;
    assert_some!(store.claim_next("default", "w1").await?);

    store.finish(job.id, json!({"ok": true})).await?;
    assert_ok!(store.finish(job.id, json!({"ok": true})).await);

    let error = assert_err!(store.fail(job.id, "boom".to_string()).await);
    assert!(matches!(error, StoreError::Conflict { .. }), "{error}");

    let finished = store.get(job.id).await?;
    assert_eq!(finished.status, JobStatus::Finished);
    assert_eq!(finished.result, Some(json!({"ok": true})));

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn requeue_resets_a_failed_job() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let job = store.create("t", "default", json!({})).await?;
    assert_some!(store.claim_next("default", "w1").await?);
    store.fail(job.id, "flaky".to_string()).await?;

    store.requeue(job.id).await?;

    let requeued = store.get(job.id).await?;
    assert_eq!(requeued.status, JobStatus::New);
    assert_none!(requeued.claimed_by);
    assert_none!(requeued.message);
    assert_eq!(requeued.retry_count, 1);

    Ok(())
}

#[derive(Serialize, Deserialize)]
struct ResizeImage {
    path: String,
    width: u32,
}

impl BackgroundJob for ResizeImage {
    const JOB_TYPE: &'static str = "resize_image";
    const QUEUE: &'static str = "long_tasks";
    type Context = ();
    type Output = String;

    async fn run(&self, _ctx: Self::Context, progress: ProgressHandle) -> anyhow::Result<String> {
        progress.set(50).await;
        Ok(format!("{}@{}px", self.path, self.width))
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn polling_runner_drains_the_queue() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let transport = Transport::connect(NotificationMode::Polling, &Default::default());
    let enqueuer = Enqueuer::new(store.clone(), transport.notifier());

    let job_id = ResizeImage {
        path: "cat.png".to_string(),
        width: 640,
    }
    .enqueue(&enqueuer)
    .await?;

    let runner = Runner::new(store.clone(), transport, ())
        .register_with::<ResizeImage>(|queue| queue.poll_interval(Duration::from_millis(10)))
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await;

    let job = enqueuer.status(job_id).await?;
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.result, Some(json!("cat.png@640px")));
    assert_some!(job.ended_at);

    Ok(())
}
