//! In-process broker for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::broker::{Delivery, DeliveryOutcome, JobBroker, JobNotice};
use crate::errors::BrokerError;

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>;

/// A [`JobBroker`] that fans notices out over tokio channels.
///
/// Deliveries carry a real acknowledgement: a nacked notice is redelivered
/// once to the then-current subscribers, after which it is dropped (there is
/// no dead-letter store — the polling safety net is the backstop, as it is
/// for every broker here).
#[derive(Clone, Default)]
pub struct InProcessBroker {
    topics: Arc<Mutex<Subscribers>>,
}

impl InProcessBroker {
    /// Create a broker with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, notice: &JobNotice, redeliverable: bool) {
        let mut topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(senders) = topics.get_mut(&notice.queue) else {
            trace!(queue = %notice.queue, "no subscribers for notice");
            return;
        };
        senders.retain(|sender| !sender.is_closed());

        for sender in senders.iter() {
            let delivery = if redeliverable {
                let (tx, rx) = oneshot::channel();
                self.watch_for_nack(notice.clone(), rx);
                Delivery::with_outcome(notice.clone(), tx)
            } else {
                Delivery::new(notice.clone())
            };
            let _ = sender.send(delivery);
        }
    }

    fn watch_for_nack(&self, notice: JobNotice, rx: oneshot::Receiver<DeliveryOutcome>) {
        let broker = self.clone();
        tokio::spawn(async move {
            if let Ok(DeliveryOutcome::Nack) = rx.await {
                trace!(job.id = notice.job_id, "redelivering nacked notice");
                broker.deliver(&notice, false);
            }
        });
    }
}

impl std::fmt::Debug for InProcessBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobBroker for InProcessBroker {
    async fn publish(&self, notice: &JobNotice) -> Result<(), BrokerError> {
        self.deliver(notice, true);
        Ok(())
    }

    fn subscribe(&self, queues: &[&str]) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for queue in queues {
            topics.entry((*queue).to_string()).or_default().push(tx.clone());
        }
        Ok(rx)
    }
}
