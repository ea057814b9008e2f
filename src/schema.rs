//! Job records and the job state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue name used when a job declares no specific queue.
pub const DEFAULT_QUEUE: &str = "default";

/// Conventional queue name for long-running jobs.
pub const LONG_TASKS_QUEUE: &str = "long_tasks";

/// Processing state of a job.
///
/// The only legal transitions are `New → Started` (claim) and
/// `Started → Finished` / `Started → Failed` (terminal). An administrative
/// requeue is the single way back to `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Enqueued, not yet claimed by any worker.
    New,
    /// Claimed by exactly one worker and currently executing.
    Started,
    /// Completed successfully; `result` is set.
    Finished,
    /// Completed unsuccessfully; `message` is set.
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// The lowercase wire/database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized status string.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized job status {0:?}")]
pub struct ParseJobStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobStatus::New),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// A background job record.
///
/// This is the snapshot clients read when polling job status; `result` and
/// `progress` are not authoritative before the job reaches `Started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned by the store at creation.
    pub id: i64,
    /// Type tag selecting the handler that executes this job.
    pub job_type: String,
    /// Logical partition the job belongs to.
    pub queue: String,
    /// Current processing state.
    pub status: JobStatus,
    /// Percentage complete (0..=100), set by the executing handler.
    pub progress: Option<i16>,
    /// Opaque handler input, set at creation.
    pub data: Value,
    /// Handler output, set once at the transition to `Finished`.
    pub result: Option<Value>,
    /// Failure detail, set once at the transition to `Failed`.
    pub message: Option<String>,
    /// When the job was created.
    pub enqueued_at: DateTime<Utc>,
    /// When the job was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Identifier of the worker that claimed the job.
    pub claimed_by: Option<String>,
    /// Number of administrative requeues this job has been through.
    pub retry_count: i32,
}
