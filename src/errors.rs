use thiserror::Error;

use crate::schema::JobStatus;

/// Errors returned by [`JobStore`](crate::JobStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No job exists with the given id.
    #[error("job not found")]
    NotFound,

    /// The operation is not legal for the job's current status, e.g.
    /// finishing a job that already failed.
    #[error("cannot {attempted} job in status {actual}")]
    Conflict {
        /// The transition that was attempted.
        attempted: &'static str,
        /// The status the job was actually in.
        actual: JobStatus,
    },

    /// The underlying storage is unreachable. Fatal to worker loops.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn conflict(attempted: &'static str, actual: JobStatus) -> Self {
        StoreError::Conflict { attempted, actual }
    }
}

/// Errors returned when enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error("failed to serialize job payload")]
    SerializationError(#[from] serde_json::Error),

    /// The job record could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by broker backends.
///
/// Publish failures are logged and swallowed by the enqueue path (the store
/// record is the durable source of truth); connect failures degrade the
/// process to polling.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the connection.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// A notice could not be published.
    #[error("broker publish failed: {0}")]
    Publish(String),

    /// A subscription could not be established.
    #[error("broker subscribe failed: {0}")]
    Subscribe(String),
}
