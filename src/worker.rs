use crate::broker::Delivery;
use crate::errors::StoreError;
use crate::job_registry::JobRegistry;
use crate::progress::ProgressHandle;
use crate::schema::Job;
use crate::store::JobStore;
use crate::util::panic_message;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) queue_name: String,
    pub(crate) worker_id: String,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Poll the queue forever, or until it is empty if
    /// `shutdown_when_queue_empty` is set.
    ///
    /// A storage outage stops the loop — spinning claims against a dead
    /// store helps nobody, and restarting is process supervision's job.
    pub(crate) async fn run(&self) {
        loop {
            match self.claim_and_run_next().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No claimable jobs left. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No claimable jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(StoreError::Unavailable(reason)) => {
                    error!(%reason, "Job store unavailable. Stopping the worker");
                    break;
                }
                Err(error) => {
                    error!(%error, "Failed to claim next job");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Drain broker deliveries, claiming on each notice.
    ///
    /// The notice is informational: losing the claim race to a poller or a
    /// sibling worker is expected and the delivery is acknowledged anyway,
    /// because the store already settled who runs the job.
    pub(crate) async fn run_subscription(&self, mut deliveries: UnboundedReceiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            let notice = delivery.notice().clone();
            if notice.queue != self.queue_name {
                warn!(notice.queue = %notice.queue, "Notice for a queue this worker does not serve");
                delivery.nack();
                continue;
            }

            match self.store.claim_next(&notice.queue, &self.worker_id).await {
                Ok(Some(job)) => {
                    self.execute(job).await;
                    delivery.ack();
                }
                Ok(None) => {
                    trace!(job.id = notice.job_id, "Notified job already claimed elsewhere");
                    delivery.ack();
                }
                Err(StoreError::Unavailable(reason)) => {
                    error!(%reason, "Job store unavailable. Stopping the subscription listener");
                    delivery.nack();
                    break;
                }
                Err(error) => {
                    warn!(%error, "Failed to claim notified job");
                    delivery.nack();
                }
            }
        }
    }

    /// Claim the next job in the queue, if there is one, and execute it.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was claimed and run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if the claim itself failed
    async fn claim_and_run_next(&self) -> Result<Option<i64>, StoreError> {
        let job = self
            .store
            .claim_next(&self.queue_name, &self.worker_id)
            .await?;

        match job {
            Some(job) => {
                let job_id = job.id;
                self.execute(job).await;
                Ok(Some(job_id))
            }
            None => Ok(None),
        }
    }

    /// Execute a claimed job and record its terminal state.
    ///
    /// Exactly one of `finish`/`fail` is recorded per claim, even when the
    /// handler panics: an uncaught failure becomes the job's failure
    /// message instead of leaving it `started` forever.
    pub(crate) async fn execute(&self, job: Job) {
        let span = info_span!("job", job.id = job.id, job.job_type = %job.job_type);
        let job_id = job.id;

        let Some(run_task_fn) = self.job_registry.get(&job.job_type) else {
            let _enter = span.enter();
            let message = format!("unknown job type {}", job.job_type);
            warn!("{message}");
            self.record_failure(job_id, message).await;
            return;
        };

        debug!(parent: &span, "Running job…");

        let progress = ProgressHandle::new(self.store.clone(), job_id);
        let future = run_task_fn(self.context.clone(), job.data, progress);
        let result = AssertUnwindSafe(future)
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let outcome: Result<Value, String> = match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(payload) => Err(panic_message(payload)),
        };

        let _enter = span.enter();
        match outcome {
            Ok(value) => {
                debug!("Job finished");
                if let Err(error) = self.store.finish(job_id, value).await {
                    warn!(%error, "Failed to record job success");
                }
            }
            Err(message) => {
                warn!(message = %message, "Job failed");
                self.record_failure(job_id, message).await;
            }
        }
    }

    async fn record_failure(&self, job_id: i64, message: String) {
        if let Err(error) = self.store.fail(job_id, message).await {
            warn!(%error, "Failed to record job failure");
        }
    }
}
