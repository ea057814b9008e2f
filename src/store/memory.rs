//! In-memory job store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::StoreError;
use crate::schema::{Job, JobStatus};
use crate::store::JobStore;

/// A [`JobStore`] backed by process memory.
///
/// State transitions happen under a single mutex, which gives the same
/// claim atomicity the SQL store gets from `FOR UPDATE SKIP LOCKED`.
/// Nothing survives a restart; production deployments want
/// [`PgStore`](crate::PgStore).
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    jobs: HashMap<i64, Job>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job_type: &str, queue: &str, data: Value) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.next_id += 1;
        let job = Job {
            id: inner.next_id,
            job_type: job_type.to_string(),
            queue: queue.to_string(),
            status: JobStatus::New,
            progress: None,
            data,
            result: None,
            message: None,
            enqueued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            claimed_by: None,
            retry_count: 0,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let next_id = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::New && job.queue == queue)
            .min_by_key(|job| (job.enqueued_at, job.id))
            .map(|job| job.id);

        let Some(id) = next_id else {
            return Ok(None);
        };

        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Started;
        job.claimed_by = Some(worker_id.to_string());
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn update_progress(&self, id: i64, pct: i16) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.status == JobStatus::Started {
            job.progress = Some(pct.clamp(0, 100));
        }
        Ok(())
    }

    async fn finish(&self, id: i64, result: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        match job.status {
            JobStatus::Started => {
                job.status = JobStatus::Finished;
                job.result = Some(result);
                job.ended_at = Some(Utc::now());
                Ok(())
            }
            JobStatus::Finished => Ok(()),
            actual => Err(StoreError::conflict("finish", actual)),
        }
    }

    async fn fail(&self, id: i64, message: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        match job.status {
            JobStatus::Started => {
                job.status = JobStatus::Failed;
                job.message = Some(message);
                job.ended_at = Some(Utc::now());
                Ok(())
            }
            JobStatus::Failed => Ok(()),
            actual => Err(StoreError::conflict("fail", actual)),
        }
    }

    async fn get(&self, id: i64) -> Result<Job, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.jobs.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn requeue(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        match job.status {
            JobStatus::Started | JobStatus::Failed => {
                job.status = JobStatus::New;
                job.claimed_by = None;
                job.progress = None;
                job.started_at = None;
                job.ended_at = None;
                job.result = None;
                job.message = None;
                job.retry_count += 1;
                Ok(())
            }
            actual => Err(StoreError::conflict("requeue", actual)),
        }
    }

    async fn stale_started(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stale: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Started
                    && job.started_at.is_some_and(|started| started < cutoff)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.id);
        Ok(stale)
    }
}
