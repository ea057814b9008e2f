use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

use crate::enqueue::Enqueuer;
use crate::errors::EnqueueError;
use crate::progress::ProgressHandle;
use crate::schema::DEFAULT_QUEUE;

/// Trait for defining background jobs that can be enqueued and executed
/// asynchronously.
///
/// The implementing struct is the job payload: it is serialized into the
/// job record on enqueue and deserialized back when a worker executes it.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique type tag of the job.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Queue this job is enqueued on and executed from.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// The handler output, recorded as the job's `result` on success.
    type Output: Serialize + Send;

    /// Execute the job.
    ///
    /// `progress` reports percentage-complete to clients polling the job;
    /// an `Err` return is recorded as the job's failure `message`.
    fn run(
        &self,
        ctx: Self::Context,
        progress: ProgressHandle,
    ) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the id of the durable job record. Broker availability never
    /// affects the outcome; see [`Enqueuer::enqueue`].
    #[instrument(name = "dispatchq.enqueue", skip(self, enqueuer), fields(message = Self::JOB_TYPE))]
    fn enqueue<'a>(&'a self, enqueuer: &'a Enqueuer) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        async move { enqueuer.enqueue(Self::JOB_TYPE, Self::QUEUE, data).await }.boxed()
    }
}
