//! Redis pub/sub broker backend.
//!
//! Note: Redis pub/sub is not durable — notices published while no
//! subscriber is connected are dropped, and there is no acknowledgement, so
//! [`Delivery::ack`]/[`Delivery::nack`] are no-ops here. That is acceptable
//! for this transport: the store is the durable source of truth and the
//! polling safety net picks up anything the broker loses.

use std::thread;

use async_trait::async_trait;
use redis::Commands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{Delivery, JobBroker, JobNotice};
use crate::config::BrokerConfig;
use crate::errors::BrokerError;

/// A [`JobBroker`] publishing notices on Redis pub/sub channels.
///
/// Notices for queue `q` travel on channel `<namespace>:q` as JSON.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    client: redis::Client,
    namespace: String,
}

impl RedisBroker {
    /// Connect to the broker described by `config`.
    ///
    /// The connection is verified with a `PING` so that a misconfigured or
    /// down broker surfaces here, once, at startup — not on every publish.
    pub fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let mut conn = client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
        })
    }

    fn channel(&self, queue: &str) -> String {
        format!("{}:{}", self.namespace, queue)
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn publish(&self, notice: &JobNotice) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_string(notice).map_err(|e| BrokerError::Publish(e.to_string()))?;
        let channel = self.channel(&notice.queue);
        let client = self.client.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
            let _: i64 = conn
                .publish(&channel, payload)
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Publish(e.to_string()))?
    }

    fn subscribe(&self, queues: &[&str]) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let channels: Vec<String> = queues.iter().map(|queue| self.channel(queue)).collect();
        let client = self.client.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        // Blocking pub/sub consumption runs on a dedicated thread and is
        // bridged into the async world over the channel.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "broker subscription connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            for channel in &channels {
                if let Err(error) = pubsub.subscribe(channel) {
                    warn!(%error, channel, "broker channel subscription failed");
                    return;
                }
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(msg) => msg,
                    Err(error) => {
                        warn!(%error, "broker subscription lost");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        debug!(%error, "discarding unreadable notice");
                        continue;
                    }
                };

                let notice: JobNotice = match serde_json::from_str(&payload) {
                    Ok(notice) => notice,
                    Err(error) => {
                        debug!(%error, "discarding malformed notice");
                        continue;
                    }
                };

                if tx.send(Delivery::new(notice)).is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
