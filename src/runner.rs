use crate::background_job::BackgroundJob;
use crate::broker::Transport;
use crate::job_registry::JobRegistry;
use crate::schema::DEFAULT_QUEUE;
use crate::stale::{StaleWatch, StaleWatcher};
use crate::store::JobStore;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and executing jobs.
///
/// Spawns, per configured queue, a pool of polling workers and — when the
/// transport is push-backed — a subscription listener. Both feed the same
/// atomic claim, so push and polling coexist safely and the poller acts as
/// the safety net for notices the broker drops.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    store: Arc<dyn JobStore>,
    transport: Transport,
    queues: HashMap<String, Queue<Context, Configured>>,
    context: Context,
    shutdown_when_queue_empty: bool,
    stale_watch: Option<StaleWatch>,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send + 'static, State: std::fmt::Debug>
    std::fmt::Debug for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("transport", &self.transport)
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given store, transport and context.
    ///
    /// The transport comes from [`Transport::connect`] and is fixed for the
    /// runner's lifetime.
    pub fn new(store: Arc<dyn JobStore>, transport: Transport, context: Context) -> Self {
        Self {
            store,
            transport,
            queues: HashMap::new(),
            context,
            shutdown_when_queue_empty: false,
            stale_watch: None,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Configure a queue
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context, Configured>,
    ) -> Runner<Context, Configured> {
        self.queues
            .insert(queue_name.into(), config_fn(Queue::default()));
        self.into_configured()
    }

    /// Configure the default queue
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context, Configured>,
    ) -> Runner<Context, Configured> {
        self.configure_queue(DEFAULT_QUEUE, config_fn)
    }

    /// Register `J` on its declared queue, creating the queue with default
    /// settings when it does not exist yet.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        let queue = match self.queues.remove(J::QUEUE) {
            Some(queue) => queue.register::<J>(),
            None => Queue::default().register::<J>(),
        };
        self.queues.insert(J::QUEUE.into(), queue);
        self.into_configured()
    }

    /// Register `J` and adjust its queue's settings in one step.
    pub fn register_with<J: BackgroundJob<Context = Context>>(
        mut self,
        config_fn: impl FnOnce(Queue<Context, Configured>) -> Queue<Context, Configured>,
    ) -> Runner<Context, Configured> {
        let queue = match self.queues.remove(J::QUEUE) {
            Some(queue) => queue.register::<J>(),
            None => Queue::default().register::<J>(),
        };
        self.queues.insert(J::QUEUE.into(), config_fn(queue));
        self.into_configured()
    }

    /// Set the runner to shut down when all queues are empty.
    ///
    /// Intended for tests and drain-style batch runs; subscription
    /// listeners are still spawned but polling decides when work is done.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Watch for jobs stuck in `started` past a staleness window.
    ///
    /// Off by default: handler execution time is unbounded by design, so
    /// reclaiming is an explicit operational decision.
    pub fn stale_watch(mut self, watch: StaleWatch) -> Self {
        self.stale_watch = Some(watch);
        self
    }

    fn into_configured(self) -> Runner<Context, Configured> {
        Runner {
            store: self.store,
            transport: self.transport,
            queues: self.queues,
            context: self.context,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            stale_watch: self.stale_watch,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the
    /// polling workers to shut down.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        let mut aux = Vec::new();

        for (queue_name, queue) in &self.queues {
            let job_registry = Arc::new(queue.job_registry.clone());

            for i in 1..=queue.num_workers {
                let name = format!("{queue_name}-{i}#{}", std::process::id());
                info!(worker.name = %name, "Starting worker…");

                let worker = self.worker(queue_name, &name, job_registry.clone(), queue);
                let span = info_span!("worker", worker.name = %name);
                handles.push(tokio::spawn(
                    async move { worker.run().await }.instrument(span),
                ));
            }

            if let Transport::Push(broker) = &self.transport {
                match broker.subscribe(&[queue_name.as_str()]) {
                    Ok(deliveries) => {
                        let name = format!("{queue_name}-sub#{}", std::process::id());
                        info!(worker.name = %name, "Starting subscription listener…");

                        let worker = self.worker(queue_name, &name, job_registry.clone(), queue);
                        let span = info_span!("worker", worker.name = %name);
                        let handle = tokio::spawn(
                            async move { worker.run_subscription(deliveries).await }
                                .instrument(span),
                        );
                        aux.push(handle.abort_handle());
                    }
                    Err(error) => {
                        warn!(%error, queue = %queue_name, "Subscription unavailable, relying on polling");
                    }
                }
            }
        }

        if let Some(watch) = &self.stale_watch {
            aux.push(StaleWatcher::new(self.store.clone(), watch.clone()).start());
        }

        RunHandle { handles, aux }
    }

    fn worker(
        &self,
        queue_name: &str,
        worker_id: &str,
        job_registry: Arc<JobRegistry<Context>>,
        queue: &Queue<Context, Configured>,
    ) -> Worker<Context> {
        Worker {
            store: self.store.clone(),
            context: self.context.clone(),
            job_registry,
            queue_name: queue_name.to_string(),
            worker_id: worker_id.to_string(),
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            poll_interval: queue.poll_interval,
            jitter: queue.jitter,
        }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    aux: Vec<AbortHandle>,
}

impl RunHandle {
    /// Wait for all polling workers to shut down, then stop the
    /// subscription listeners and the stale watcher.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });

        for handle in self.aux {
            handle.abort();
        }
    }

    /// Stop everything immediately.
    pub fn abort(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.aux {
            handle.abort();
        }
    }
}

/// Configuration and state for a job queue
#[derive(Debug)]
pub struct Queue<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    _state: PhantomData<State>,
}

impl<Context: Clone + Send + Sync + 'static> Default for Queue<Context, Unconfigured> {
    fn default() -> Self {
        Self {
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Queue<Context, State> {
    /// Set the number of polling workers for this queue.
    ///
    /// Zero is valid in push deployments: the subscription listener then
    /// handles the queue alone, with no polling safety net.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Configure a job to run as part of this queue.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Queue<Context, Configured> {
        self.job_registry.register::<J>();
        Queue {
            job_registry: self.job_registry,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            _state: PhantomData,
        }
    }
}
