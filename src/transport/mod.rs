//! Topic-addressed pub/sub transport
//!
//! Messages for an activity are published on a topic equal to the activity's
//! `agent_name`. Delivery is at-least-once with per-topic FIFO; backends with
//! destructive consumption implement `ack` as a no-op. Malformed wire bytes
//! are dropped inside `receive` rather than poisoning the topic.

mod inmemory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::Config;
use crate::contracts::PaigeantMessage;
use crate::error::PaigeantError;

pub use inmemory::InMemoryTransport;
pub use redis::RedisTransport;

/// One received message: the raw wire string plus the decoded envelope.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub raw: String,
    pub message: PaigeantMessage,
}

/// Abstract transport for message brokers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection to the broker (no-op by default).
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Close the connection to the broker (no-op by default).
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Send a message to a topic/queue.
    async fn publish(&self, topic: &str, message: &PaigeantMessage) -> Result<()>;

    /// Block until the next decodable envelope arrives on `topic`.
    ///
    /// Returns `None` when `wait` elapses first; `wait = None` blocks until a
    /// message arrives. Undecodable items are dropped with a warning and the
    /// wait continues.
    async fn receive(&self, topic: &str, wait: Option<Duration>) -> Result<Option<Delivery>>;

    /// Acknowledge successful processing.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Negatively acknowledge (defaults to ack when unsupported).
    async fn nack(&self, delivery: &Delivery, _requeue: bool) -> Result<()> {
        self.ack(delivery).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Subscription
// ═══════════════════════════════════════════════════════════════════════════

/// Consume `topic` until `lifespan` elapses, or forever when `None`.
pub fn subscribe<'a>(
    transport: &'a dyn Transport,
    topic: &str,
    lifespan: Option<Duration>,
) -> Subscription<'a> {
    Subscription {
        transport,
        topic: topic.to_string(),
        deadline: lifespan.map(|span| Instant::now() + span),
    }
}

/// A bounded pull-loop over one topic.
pub struct Subscription<'a> {
    transport: &'a dyn Transport,
    topic: String,
    deadline: Option<Instant>,
}

impl Subscription<'_> {
    /// Next delivery, or `None` once the subscription's lifespan has elapsed.
    pub async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let wait = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            match self.transport.receive(&self.topic, wait).await? {
                Some(delivery) => return Ok(Some(delivery)),
                None if self.deadline.is_some() => return Ok(None),
                None => continue,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Factory
// ═══════════════════════════════════════════════════════════════════════════

/// Build the transport selected by `PAIGEANT_TRANSPORT`.
pub fn from_config(config: &Config) -> Result<Arc<dyn Transport>> {
    match config.transport_backend.as_str() {
        "inmemory" => Ok(Arc::new(InMemoryTransport::new())),
        "redis" => Ok(Arc::new(RedisTransport::new(
            config.redis_rest_url.clone(),
            config.redis_rest_token.clone(),
        ))),
        other => Err(PaigeantError::UnsupportedTransport(other.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_unknown_backend() {
        let mut config = Config::from_env();
        config.transport_backend = "carrier-pigeon".into();

        let err = match from_config(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected from_config to fail for unknown backend"),
        };
        let err = err.downcast::<PaigeantError>().unwrap();
        assert!(matches!(err, PaigeantError::UnsupportedTransport(_)));
    }
}
