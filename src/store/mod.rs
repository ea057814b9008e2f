//! Durable job storage.
//!
//! The store is the sole source of truth for job existence and state. Broker
//! notices only hint that a claim attempt is worthwhile; every state
//! transition goes through the store, and the claim operation is atomic so
//! concurrent pollers and subscribers can race for the same job safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::StoreError;
use crate::schema::Job;

mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;

/// Storage backend for job records.
///
/// Implementations must make [`claim_next`](JobStore::claim_next) an atomic
/// compare-and-swap on the job's status so that exactly one concurrent
/// caller wins each job.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new job with status `new` and return the stored record.
    async fn create(&self, job_type: &str, queue: &str, data: Value) -> Result<Job, StoreError>;

    /// Atomically claim the oldest `new` job in `queue`, transitioning it to
    /// `started` and recording `worker_id` as the claimant.
    ///
    /// Returns `None` when the queue holds no claimable job. Ordering is
    /// FIFO by `enqueued_at` (then id), best-effort across concurrent
    /// claimants.
    async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<Job>, StoreError>;

    /// Record handler progress for a `started` job.
    ///
    /// A no-op once the job is terminal: terminal transitions always win
    /// over late progress writes. `pct` is clamped to 0..=100.
    async fn update_progress(&self, id: i64, pct: i16) -> Result<(), StoreError>;

    /// Transition `started → finished`, recording the handler output.
    ///
    /// Idempotent when the job is already `finished`; a
    /// [`StoreError::Conflict`] when it is `failed` or was never started.
    async fn finish(&self, id: i64, result: Value) -> Result<(), StoreError>;

    /// Transition `started → failed`, recording the failure detail.
    ///
    /// Idempotent when the job is already `failed`; a
    /// [`StoreError::Conflict`] when it is `finished` or was never started.
    async fn fail(&self, id: i64, message: String) -> Result<(), StoreError>;

    /// Read-only snapshot of a job.
    async fn get(&self, id: i64) -> Result<Job, StoreError>;

    /// Administrative reset: `started|failed → new`.
    ///
    /// Clears the claim, progress, timestamps and outcome, and increments
    /// `retry_count`. Rejected for `finished` jobs (the result may already
    /// have been consumed) and for jobs that are already `new`.
    async fn requeue(&self, id: i64) -> Result<(), StoreError>;

    /// Jobs still `started` whose `started_at` precedes `cutoff`.
    ///
    /// Supports stale-claim monitoring after a worker crash; the store
    /// itself never reclaims anything.
    async fn stale_started(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;
}
