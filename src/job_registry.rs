use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::background_job::BackgroundJob;
use crate::progress::ProgressHandle;

pub(crate) type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Value, ProgressHandle) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Maps job type tags to type-erased run functions.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RunTaskFn<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    /// Register `J` under its `JOB_TYPE` tag.
    ///
    /// Two registrations under the same tag are a wiring bug, caught here.
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let previous = self
            .entries
            .insert(J::JOB_TYPE.to_string(), Arc::new(run_erased::<J>));
        assert!(
            previous.is_none(),
            "job type {} registered twice",
            J::JOB_TYPE
        );
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RunTaskFn<Context>> {
        self.entries.get(job_type)
    }
}

fn run_erased<J: BackgroundJob>(
    context: J::Context,
    data: Value,
    progress: ProgressHandle,
) -> BoxFuture<'static, anyhow::Result<Value>> {
    async move {
        let job: J = serde_json::from_value(data)?;
        let output = job.run(context, progress).await?;
        Ok(serde_json::to_value(output)?)
    }
    .boxed()
}
