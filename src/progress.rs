//! Progress reporting for running handlers.

use std::sync::Arc;

use tracing::debug;

use crate::errors::StoreError;
use crate::store::JobStore;

/// Reports percentage-complete for a single running job.
///
/// Handed to every handler invocation, bound to the claimed job. Updates
/// that race a terminal transition are dropped by the store; this handle
/// treats that (and every other update problem) as non-fatal, since progress
/// is advisory and the handler's real outcome is what matters.
#[derive(Clone)]
pub struct ProgressHandle {
    store: Arc<dyn JobStore>,
    job_id: i64,
}

impl ProgressHandle {
    pub(crate) fn new(store: Arc<dyn JobStore>, job_id: i64) -> Self {
        Self { store, job_id }
    }

    /// Id of the job this handle reports for.
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Record `pct` percent complete, clamped to 0..=100.
    pub async fn set(&self, pct: u8) {
        let pct = i16::from(pct.min(100));
        match self.store.update_progress(self.job_id, pct).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                debug!(job.id = self.job_id, "progress update for unknown job");
            }
            Err(error) => {
                debug!(job.id = self.job_id, %error, "progress update dropped");
            }
        }
    }
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}
