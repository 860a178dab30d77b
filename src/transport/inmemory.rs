//! In-memory transport for single-process workflows and tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::{Delivery, Transport};
use crate::contracts::PaigeantMessage;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Per-topic FIFO deques guarded by one async lock.
///
/// Consumption is destructive, so `ack` is a no-op.
#[derive(Default)]
pub struct InMemoryTransport {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes to a topic, bypassing serialization.
    ///
    /// Exists so malformed-envelope handling can be exercised; `publish` is
    /// the only path real senders use.
    pub async fn push_raw(&self, topic: &str, raw: impl Into<String>) {
        let mut queues = self.queues.lock().await;
        queues.entry(topic.to_string()).or_default().push_back(raw.into());
    }

    /// Number of messages currently queued on `topic`.
    pub async fn pending(&self, topic: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(topic).map(VecDeque::len).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, message: &PaigeantMessage) -> Result<()> {
        let raw = message.to_json()?;
        let mut queues = self.queues.lock().await;
        queues.entry(topic.to_string()).or_default().push_back(raw);
        Ok(())
    }

    async fn receive(&self, topic: &str, wait: Option<Duration>) -> Result<Option<Delivery>> {
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            let popped = {
                let mut queues = self.queues.lock().await;
                queues.get_mut(topic).and_then(VecDeque::pop_front)
            };

            if let Some(raw) = popped {
                match PaigeantMessage::from_json(&raw) {
                    Ok(message) => return Ok(Some(Delivery { raw, message })),
                    Err(error) => {
                        // Drop the item and keep consuming the topic.
                        warn!(topic, %error, "dropping malformed envelope");
                        continue;
                    }
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ActivitySpec, PaigeantMessage, RoutingSlip};

    fn message(correlation_id: &str) -> PaigeantMessage {
        PaigeantMessage::new(
            correlation_id,
            RoutingSlip::new(vec![ActivitySpec::new("a", "p")]),
        )
    }

    #[tokio::test]
    async fn test_publish_receive_fifo() {
        let transport = InMemoryTransport::new();
        transport.publish("a", &message("c1")).await.unwrap();
        transport.publish("a", &message("c2")).await.unwrap();

        let first = transport.receive("a", None).await.unwrap().unwrap();
        let second = transport.receive("a", None).await.unwrap().unwrap();
        assert_eq!(first.message.correlation_id, "c1");
        assert_eq!(second.message.correlation_id, "c2");
        assert_eq!(transport.pending("a").await, 0);
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_topic() {
        let transport = InMemoryTransport::new();
        let result = transport
            .receive("empty", Some(Duration::from_millis(60)))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let transport = InMemoryTransport::new();
        transport.publish("a", &message("c1")).await.unwrap();

        assert_eq!(transport.pending("a").await, 1);
        assert_eq!(transport.pending("b").await, 0);
        let from_b = transport
            .receive("b", Some(Duration::from_millis(40)))
            .await
            .unwrap();
        assert!(from_b.is_none());
    }

    #[tokio::test]
    async fn test_malformed_item_is_skipped() {
        let transport = InMemoryTransport::new();
        transport.push_raw("a", "{not json").await;
        transport.publish("a", &message("c1")).await.unwrap();

        let delivery = transport
            .receive("a", Some(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.correlation_id, "c1");
    }
}
