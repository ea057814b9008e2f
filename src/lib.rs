#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
/// Push notification of job readiness.
pub mod broker;
/// Deployment configuration for the notification transport.
pub mod config;
mod enqueue;
mod errors;
mod job_registry;
mod progress;
mod runner;
/// Job records and the job state machine.
pub mod schema;
mod stale;
/// Durable job storage backends.
pub mod store;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
pub use self::broker::{Delivery, InProcessBroker, JobBroker, JobNotice, Notifier, Transport};
#[cfg(feature = "redis")]
pub use self::broker::redis::RedisBroker;
pub use self::config::{BrokerConfig, NotificationMode};
/// Creates jobs and reads their status.
pub use self::enqueue::Enqueuer;
pub use self::errors::{BrokerError, EnqueueError, StoreError};
/// Progress reporting handle passed to running handlers.
pub use self::progress::ProgressHandle;
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, Queue, RunHandle, Runner, Unconfigured};
pub use self::schema::{DEFAULT_QUEUE, Job, JobStatus, LONG_TASKS_QUEUE};
pub use self::stale::{StaleAction, StaleWatch};
pub use self::store::{JobStore, MemoryStore};
#[cfg(feature = "postgres")]
pub use self::store::postgres::{PgStore, setup_database};
