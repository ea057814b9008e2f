//! Push notification of job readiness.
//!
//! Brokers carry lightweight "job ready" notices so workers can claim work
//! without waiting for the next poll tick. Notices are informational: the
//! store claim decides who actually runs a job, so lost or duplicated
//! notices are harmless.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::{BrokerConfig, NotificationMode};
use crate::errors::BrokerError;

mod in_process;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_process::InProcessBroker;

/// The "job ready" message published on enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotice {
    /// Id of the freshly created job.
    pub job_id: i64,
    /// Queue the job was enqueued on.
    pub queue: String,
}

#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    Ack,
    Nack,
}

/// A notice delivered to a subscriber, carrying its acknowledgement.
///
/// Consumers must [`ack`](Delivery::ack) once the notice has been handled —
/// including when the claim was lost to a racing worker, since the store is
/// authoritative — and [`nack`](Delivery::nack) when the notice could not be
/// processed at all, so the broker may redeliver or dead-letter it.
/// Dropping a delivery without deciding is treated as neither.
#[derive(Debug)]
pub struct Delivery {
    notice: JobNotice,
    outcome: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl Delivery {
    /// A delivery with no acknowledgement channel, for fire-and-forget
    /// brokers.
    pub fn new(notice: JobNotice) -> Self {
        Self {
            notice,
            outcome: None,
        }
    }

    pub(crate) fn with_outcome(notice: JobNotice, tx: oneshot::Sender<DeliveryOutcome>) -> Self {
        Self {
            notice,
            outcome: Some(tx),
        }
    }

    /// The delivered notice.
    pub fn notice(&self) -> &JobNotice {
        &self.notice
    }

    /// Acknowledge the notice as handled.
    pub fn ack(self) {
        if let Some(tx) = self.outcome {
            let _ = tx.send(DeliveryOutcome::Ack);
        }
    }

    /// Reject the notice so the broker may redeliver or dead-letter it.
    pub fn nack(self) {
        if let Some(tx) = self.outcome {
            let _ = tx.send(DeliveryOutcome::Nack);
        }
    }
}

/// A message broker carrying [`JobNotice`]s.
#[async_trait]
pub trait JobBroker: Send + Sync + 'static {
    /// Publish a notice to subscribers of its queue. Best-effort.
    async fn publish(&self, notice: &JobNotice) -> Result<(), BrokerError>;

    /// Subscribe to deliveries for the named queues.
    fn subscribe(&self, queues: &[&str]) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;
}

/// The notification transport a process runs with, decided once at startup.
///
/// [`Transport::connect`] consumes the deployment's notification mode and
/// broker parameters exactly once; after that the choice is fixed for the
/// process lifetime and no call site ever re-evaluates broker availability.
#[derive(Clone)]
pub enum Transport {
    /// A live broker connection; workers subscribe and enqueues publish.
    Push(Arc<dyn JobBroker>),
    /// No broker; workers rely on store polling alone.
    Polling,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Push(_) => f.write_str("Transport::Push"),
            Transport::Polling => f.write_str("Transport::Polling"),
        }
    }
}

impl Transport {
    /// Resolve the transport for this process.
    ///
    /// In `Polling` mode no connection is attempted. In `Broker` mode a
    /// connection failure is logged once and the process falls back to
    /// polling — job processing availability outranks the notification
    /// transport.
    pub fn connect(mode: NotificationMode, config: &BrokerConfig) -> Transport {
        match mode {
            NotificationMode::Polling => Transport::Polling,
            NotificationMode::Broker => Self::connect_broker(config),
        }
    }

    #[cfg(feature = "redis")]
    fn connect_broker(config: &BrokerConfig) -> Transport {
        match redis::RedisBroker::connect(config) {
            Ok(broker) => Transport::Push(Arc::new(broker)),
            Err(error) => {
                warn!(%error, "broker unavailable, falling back to polling");
                Transport::Polling
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    fn connect_broker(_config: &BrokerConfig) -> Transport {
        warn!("broker mode requested but no broker backend is compiled in, falling back to polling");
        Transport::Polling
    }

    /// Wrap an already-connected broker, e.g. an [`InProcessBroker`].
    pub fn push(broker: Arc<dyn JobBroker>) -> Transport {
        Transport::Push(broker)
    }

    /// The enqueue-side view of this transport.
    pub fn notifier(&self) -> Notifier {
        match self {
            Transport::Push(broker) => Notifier::Push(broker.clone()),
            Transport::Polling => Notifier::Disabled,
        }
    }
}

/// Publishes "job ready" notices after enqueue, or does nothing in
/// polling-only deployments.
#[derive(Clone)]
pub enum Notifier {
    /// Publish notices to the connected broker.
    Push(Arc<dyn JobBroker>),
    /// No-op; pollers will find the job.
    Disabled,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notifier::Push(_) => f.write_str("Notifier::Push"),
            Notifier::Disabled => f.write_str("Notifier::Disabled"),
        }
    }
}

impl Notifier {
    /// Publish a notice.
    ///
    /// Publish failures are logged and swallowed: the job row is already
    /// durable and pollers will pick it up, so a broker hiccup must not
    /// unwind the enqueue.
    pub async fn notify(&self, notice: &JobNotice) {
        match self {
            Notifier::Disabled => {}
            Notifier::Push(broker) => {
                if let Err(error) = broker.publish(notice).await {
                    warn!(job.id = notice.job_id, %error, "failed to publish job notice");
                }
            }
        }
    }

    /// Whether notices are actually published.
    pub fn is_push(&self) -> bool {
        matches!(self, Notifier::Push(_))
    }
}
