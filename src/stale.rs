//! Detection of stale claims left behind by crashed or wedged workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::warn;

use crate::store::JobStore;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// What to do with a job whose claim has gone stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleAction {
    /// Log a warning and leave the job alone (external monitoring decides).
    Warn,
    /// Requeue the job so another worker can claim it. The requeue goes
    /// through the administrative reset, so `retry_count` records it.
    Requeue,
}

/// Configuration for the stale-claim watcher.
#[derive(Debug, Clone)]
pub struct StaleWatch {
    /// How long a job may sit in `started` before it counts as stale.
    pub window: Duration,
    /// How often the watcher scans the store.
    pub check_interval: Duration,
    /// What to do with each stale job found.
    pub action: StaleAction,
}

impl StaleWatch {
    /// Watch with the given staleness window and action, scanning once a
    /// minute.
    pub fn new(window: Duration, action: StaleAction) -> Self {
        Self {
            window,
            check_interval: DEFAULT_CHECK_INTERVAL,
            action,
        }
    }

    /// Override the scan interval.
    pub fn check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }
}

/// Periodic scanner for claims older than the configured window.
pub(crate) struct StaleWatcher {
    store: Arc<dyn JobStore>,
    watch: StaleWatch,
}

impl StaleWatcher {
    pub(crate) fn new(store: Arc<dyn JobStore>, watch: StaleWatch) -> Self {
        Self { store, watch }
    }

    pub(crate) fn start(self) -> AbortHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.watch.check_interval);
            loop {
                ticker.tick().await;
                self.scan().await;
            }
        });
        task.abort_handle()
    }

    async fn scan(&self) {
        let Ok(window) = chrono::Duration::from_std(self.watch.window) else {
            return;
        };
        let Some(cutoff) = chrono::Utc::now().checked_sub_signed(window) else {
            return;
        };

        let stale = match self.store.stale_started(cutoff).await {
            Ok(stale) => stale,
            Err(error) => {
                warn!(%error, "Stale claim scan failed");
                return;
            }
        };

        for job in stale {
            match self.watch.action {
                StaleAction::Warn => {
                    warn!(
                        job.id = job.id,
                        job.claimed_by = job.claimed_by.as_deref().unwrap_or(""),
                        "Job exceeded the staleness window"
                    );
                }
                StaleAction::Requeue => {
                    warn!(
                        job.id = job.id,
                        job.claimed_by = job.claimed_by.as_deref().unwrap_or(""),
                        "Requeueing job that exceeded the staleness window"
                    );
                    if let Err(error) = self.store.requeue(job.id).await {
                        warn!(job.id = job.id, %error, "Failed to requeue stale job");
                    }
                }
            }
        }
    }
}
