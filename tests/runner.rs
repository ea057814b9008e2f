#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_none, assert_ok, assert_some};
use dispatchq::{
    BackgroundJob, Enqueuer, Job, JobStatus, JobStore, MemoryStore, NotificationMode,
    ProgressHandle, Runner, Transport,
};
use insta::assert_compact_json_snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) fn create_store() -> Arc<dyn JobStore> {
        Arc::new(MemoryStore::new())
    }

    pub(super) fn polling_transport() -> Transport {
        Transport::connect(NotificationMode::Polling, &Default::default())
    }

    /// Create a test runner with common configuration
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        store: Arc<dyn JobStore>,
        context: Context,
    ) -> Runner<Context> {
        Runner::new(store, polling_transport(), context)
    }

    pub(super) fn create_enqueuer(store: Arc<dyn JobStore>) -> Enqueuer {
        Enqueuer::new(store, polling_transport().notifier())
    }

    pub(super) fn fast<Context: Clone + Send + Sync + 'static>(
        queue: dispatchq::Queue<Context, dispatchq::Configured>,
    ) -> dispatchq::Queue<Context, dispatchq::Configured> {
        queue
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::from_millis(2))
    }
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
    type Output = Value;

    async fn run(&self, _ctx: Self::Context, progress: ProgressHandle) -> anyhow::Result<Value> {
        progress.set(50).await;
        Ok(json!({"path": self.path, "width": self.width}))
    }
}

#[tokio::test]
async fn enqueued_job_reaches_finished_with_the_handler_output() {
    let store = test_utils::create_store();
    let enqueuer = test_utils::create_enqueuer(store.clone());

    let runner = test_utils::create_test_runner(store.clone(), ())
        .register_with::<ResizeImage>(test_utils::fast)
        .shutdown_when_queue_empty();

    let job = ResizeImage {
        path: "cat.png".to_string(),
        width: 640,
    };
    let job_id = assert_ok!(job.enqueue(&enqueuer).await);

    let pending = assert_ok!(enqueuer.status(job_id).await);
    assert_eq!(pending.status, JobStatus::New);

    runner.start().wait_for_shutdown().await;

    let job = assert_ok!(enqueuer.status(job_id).await);
    assert_eq!(job.status, JobStatus::Finished);
    assert_compact_json_snapshot!(job.result, @r#"{"path": "cat.png", "width": 640}"#);
    assert_none!(job.message);
    assert_some!(job.ended_at);
    assert!(job.started_at.unwrap() >= job.enqueued_at);
    assert!(job.ended_at.unwrap() >= job.started_at.unwrap());
}

#[tokio::test]
async fn failing_handlers_mark_the_job_failed_and_the_loop_continues() {
    #[derive(Serialize, Deserialize)]
    struct FailingJob;

    impl BackgroundJob for FailingJob {
        const JOB_TYPE: &'static str = "failing";
        type Context = ();
        type Output = ();

        async fn run(&self, _ctx: Self::Context, _progress: ProgressHandle) -> anyhow::Result<()> {
            anyhow::bail!("no space left on device")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct OkJob;

    impl BackgroundJob for OkJob {
        const JOB_TYPE: &'static str = "ok";
        type Context = ();
        type Output = &'static str;

        async fn run(
            &self,
            _ctx: Self::Context,
            _progress: ProgressHandle,
        ) -> anyhow::Result<&'static str> {
            Ok("done")
        }
    }

    let store = test_utils::create_store();
    let enqueuer = test_utils::create_enqueuer(store.clone());

    let failed_id = assert_ok!(FailingJob.enqueue(&enqueuer).await);
    let ok_id = assert_ok!(OkJob.enqueue(&enqueuer).await);

    let runner = test_utils::create_test_runner(store.clone(), ())
        .register_with::<FailingJob>(|queue| test_utils::fast(queue).num_workers(1))
        .register::<OkJob>()
        .shutdown_when_queue_empty();

    runner.start().wait_for_shutdown().await;

    let failed = assert_ok!(enqueuer.status(failed_id).await);
    assert_eq!(failed.status, JobStatus::Failed);
    let message = assert_some!(failed.message);
    assert!(message.contains("no space left on device"), "{message}");
    assert_none!(failed.result);

    let ok = assert_ok!(enqueuer.status(ok_id).await);
    assert_eq!(ok.status, JobStatus::Finished);
    assert_eq!(ok.result, Some(json!("done")));
}

#[tokio::test]
async fn panicking_handlers_still_leave_a_terminal_state() {
    #[derive(Serialize, Deserialize)]
    struct PanickingJob;

    impl BackgroundJob for PanickingJob {
        const JOB_TYPE: &'static str = "panicking";
        type Context = ();
        type Output = ();

        async fn run(&self, _ctx: Self::Context, _progress: ProgressHandle) -> anyhow::Result<()> {
            panic!("index out of bounds")
        }
    }

    let store = test_utils::create_store();
    let enqueuer = test_utils::create_enqueuer(store.clone());
    let job_id = assert_ok!(PanickingJob.enqueue(&enqueuer).await);

    let runner = test_utils::create_test_runner(store.clone(), ())
        .register_with::<PanickingJob>(test_utils::fast)
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await;

    let job = assert_ok!(enqueuer.status(job_id).await);
    assert_eq!(job.status, JobStatus::Failed);
    let message = assert_some!(job.message);
    assert!(message.contains("panicked"), "{message}");
    assert!(message.contains("index out of bounds"), "{message}");
}

#[tokio::test]
async fn unknown_job_types_fail_without_disturbing_later_jobs() {
    #[derive(Serialize, Deserialize)]
    struct KnownJob;

    impl BackgroundJob for KnownJob {
        const JOB_TYPE: &'static str = "known";
        type Context = ();
        type Output = ();

        async fn run(&self, _ctx: Self::Context, _progress: ProgressHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let store = test_utils::create_store();
    let enqueuer = test_utils::create_enqueuer(store.clone());

    // Enqueued through the untyped interface: nothing registered this tag.
    let unknown_id = assert_ok!(enqueuer.enqueue("does_not_exist", "default", json!({})).await);
    let known_id = assert_ok!(KnownJob.enqueue(&enqueuer).await);

    let runner = test_utils::create_test_runner(store.clone(), ())
        .register_with::<KnownJob>(|queue| test_utils::fast(queue).num_workers(1))
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await;

    let unknown = assert_ok!(enqueuer.status(unknown_id).await);
    assert_eq!(unknown.status, JobStatus::Failed);
    let message = assert_some!(unknown.message);
    assert!(message.contains("unknown job type"), "{message}");
    assert!(message.contains("does_not_exist"), "{message}");

    let known = assert_ok!(enqueuer.status(known_id).await);
    assert_eq!(known.status, JobStatus::Finished);
}

#[tokio::test]
async fn progress_is_visible_while_the_job_runs() {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct SlowJob;

    impl BackgroundJob for SlowJob {
        const JOB_TYPE: &'static str = "slow";
        type Context = TestContext;
        type Output = ();

        async fn run(&self, ctx: TestContext, progress: ProgressHandle) -> anyhow::Result<()> {
            progress.set(42).await;
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let store = test_utils::create_store();
    let enqueuer = test_utils::create_enqueuer(store.clone());
    let job_id = assert_ok!(SlowJob.enqueue(&enqueuer).await);

    let runner = test_utils::create_test_runner(store.clone(), test_context.clone())
        .register_with::<SlowJob>(test_utils::fast)
        .shutdown_when_queue_empty();
    let runner = runner.start();

    test_context.job_started_barrier.wait().await;

    let running = assert_ok!(enqueuer.status(job_id).await);
    assert_eq!(running.status, JobStatus::Started);
    assert_eq!(running.progress, Some(42));
    assert_some!(running.claimed_by);
    assert_none!(running.ended_at);

    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    let done = assert_ok!(enqueuer.status(job_id).await);
    assert_eq!(done.status, JobStatus::Finished);
}

#[tokio::test]
async fn stale_watcher_requeues_abandoned_claims() {
    use dispatchq::{StaleAction, StaleWatch};

    #[derive(Serialize, Deserialize)]
    struct NoopJob;

    impl BackgroundJob for NoopJob {
        const JOB_TYPE: &'static str = "noop";
        type Context = ();
        type Output = ();

        async fn run(&self, _ctx: Self::Context, _progress: ProgressHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let store = test_utils::create_store();

    // Simulate a worker that claimed a job and then died.
    let job = assert_ok!(store.create("noop", "default", json!({})).await);
    assert_some!(assert_ok!(store.claim_next("default", "crashed-worker").await));

    // No polling workers: only the watcher acts on the store.
    let runner = test_utils::create_test_runner(store.clone(), ())
        .register_with::<NoopJob>(|queue| queue.num_workers(0))
        .stale_watch(
            StaleWatch::new(Duration::from_millis(10), StaleAction::Requeue)
                .check_interval(Duration::from_millis(20)),
        );
    let handle = runner.start();

    let deadline = async {
        loop {
            let job = store.get(job.id).await.unwrap();
            if job.status == JobStatus::New {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let requeued = tokio::time::timeout(Duration::from_secs(5), deadline)
        .await
        .expect("stale job was never requeued");

    assert_none!(requeued.claimed_by);
    assert_eq!(requeued.retry_count, 1);

    handle.abort();
}

#[tokio::test]
async fn queues_are_processed_by_their_own_worker_pools() {
    #[derive(Serialize, Deserialize)]
    struct ShortJob;

    impl BackgroundJob for ShortJob {
        const JOB_TYPE: &'static str = "short";
        type Context = ();
        type Output = &'static str;

        async fn run(
            &self,
            _ctx: Self::Context,
            _progress: ProgressHandle,
        ) -> anyhow::Result<&'static str> {
            Ok("short done")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct LongJob;

    impl BackgroundJob for LongJob {
        const JOB_TYPE: &'static str = "long";
        const QUEUE: &'static str = "long_tasks";
        type Context = ();
        type Output = &'static str;

        async fn run(
            &self,
            _ctx: Self::Context,
            _progress: ProgressHandle,
        ) -> anyhow::Result<&'static str> {
            Ok("long done")
        }
    }

    let store = test_utils::create_store();
    let enqueuer = test_utils::create_enqueuer(store.clone());

    let short_id = assert_ok!(ShortJob.enqueue(&enqueuer).await);
    let long_id = assert_ok!(LongJob.enqueue(&enqueuer).await);

    let short_job = assert_ok!(enqueuer.status(short_id).await);
    let long_job = assert_ok!(enqueuer.status(long_id).await);
    assert_eq!(short_job.queue, "default");
    assert_eq!(long_job.queue, "long_tasks");

    let runner = test_utils::create_test_runner(store.clone(), ())
        .register_with::<ShortJob>(test_utils::fast)
        .register_with::<LongJob>(|queue| test_utils::fast(queue).num_workers(2))
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await;

    for (id, result) in [(short_id, "short done"), (long_id, "long done")] {
        let job: Job = assert_ok!(enqueuer.status(id).await);
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.result, Some(json!(result)));
    }
}
