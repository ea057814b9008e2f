//! Creating jobs and reading their status.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::broker::{JobNotice, Notifier};
use crate::errors::{EnqueueError, StoreError};
use crate::schema::Job;
use crate::store::JobStore;

/// Creates job records and, in push deployments, notifies the broker.
///
/// Cheap to clone; application code typically keeps one per process.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    notifier: Notifier,
}

impl Enqueuer {
    /// Build an enqueuer over `store`, publishing through `notifier`.
    ///
    /// Obtain the notifier from [`Transport::notifier`](crate::Transport::notifier)
    /// so the enqueue side and the workers agree on the notification mode.
    pub fn new(store: Arc<dyn JobStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Create a job and return its id.
    ///
    /// The job record is durable before any notice is published; a publish
    /// failure is logged and the id is returned regardless, so enqueueing
    /// never blocks on broker availability.
    pub async fn enqueue(
        &self,
        job_type: &str,
        queue: &str,
        data: Value,
    ) -> Result<i64, EnqueueError> {
        let job = self.store.create(job_type, queue, data).await?;
        debug!(job.id = job.id, job.job_type = job_type, job.queue = queue, "job enqueued");

        self.notifier
            .notify(&JobNotice {
                job_id: job.id,
                queue: job.queue,
            })
            .await;

        Ok(job.id)
    }

    /// Snapshot of a job for clients polling status, progress and outcome.
    pub async fn status(&self, id: i64) -> Result<Job, StoreError> {
        self.store.get(id).await
    }

    /// Administratively reset a `started` or `failed` job to `new`.
    pub async fn requeue(&self, id: i64) -> Result<(), StoreError> {
        self.store.requeue(id).await
    }

    /// The underlying job store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}

impl std::fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enqueuer")
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}
