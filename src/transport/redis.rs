//! Redis-list transport over the Upstash-style REST bridge
//!
//! One list per topic, `LPUSH` to publish, polled `RPOP` to consume, so
//! per-topic order is FIFO and consumption is destructive. Ack is a no-op.
//! Competing workers on the same topic race the pop, which distributes
//! deliveries across a pool.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use super::{Delivery, Transport};
use crate::contracts::PaigeantMessage;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Key prefix for workflow topics; a backend detail, not part of the envelope.
fn queue_key(topic: &str) -> String {
    format!("paigeant:{topic}")
}

/// Shape of every REST bridge response.
#[derive(Debug, Deserialize)]
struct RedisResponse {
    result: Value,
}

/// Redis-backed transport for cross-process messaging.
pub struct RedisTransport {
    http_client: reqwest::Client,
    rest_url: String,
    rest_token: String,
}

impl RedisTransport {
    pub fn new(rest_url: String, rest_token: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");

        Self {
            http_client,
            rest_url,
            rest_token,
        }
    }

    /// Execute a Redis command via the REST bridge.
    async fn execute(&self, command: Vec<Value>) -> Result<Value> {
        let response = self
            .http_client
            .post(&self.rest_url)
            .header("Authorization", format!("Bearer {}", self.rest_token))
            .json(&command)
            .send()
            .await
            .context("failed to send Redis request")?;

        let redis_response: RedisResponse = response
            .json()
            .await
            .context("failed to parse Redis response")?;

        Ok(redis_response.result)
    }

    /// LPUSH - append a serialized envelope to the topic's list.
    async fn lpush(&self, key: &str, value: &str) -> Result<Value> {
        self.execute(vec![
            Value::String("LPUSH".to_string()),
            Value::String(key.to_string()),
            Value::String(value.to_string()),
        ])
        .await
    }

    /// RPOP - take the oldest entry from the topic's list.
    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .execute(vec![
                Value::String("RPOP".to_string()),
                Value::String(key.to_string()),
            ])
            .await?;

        match result {
            Value::String(raw) => Ok(Some(raw)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(&self) -> Result<()> {
        self.execute(vec![Value::String("PING".to_string())])
            .await
            .context("Redis connection check failed")?;
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &PaigeantMessage) -> Result<()> {
        let raw = message.to_json()?;
        self.lpush(&queue_key(topic), &raw).await?;
        Ok(())
    }

    async fn receive(&self, topic: &str, wait: Option<Duration>) -> Result<Option<Delivery>> {
        let key = queue_key(topic);
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            if let Some(raw) = self.rpop(&key).await? {
                match PaigeantMessage::from_json(&raw) {
                    Ok(message) => return Ok(Some(Delivery { raw, message })),
                    Err(error) => {
                        // Consumption already removed the item; dropping it is
                        // the nack-no-requeue for this backend.
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
        // Consumption is destructive; there is nothing left to acknowledge.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_prefixes_topic() {
        assert_eq!(queue_key("researcher"), "paigeant:researcher");
    }
}
