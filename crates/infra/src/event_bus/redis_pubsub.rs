//! Redis pub/sub bus for outbound events (optional).
//!
//! Not durable: an offline subscriber misses messages and has to re-read
//! the event log from its last known sequence.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::warn;

use stockflow_events::{BusError, EventBus, OutboundEvent, Subscription};

/// Publishes [`OutboundEvent`]s as JSON on one channel.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<OutboundEvent> for RedisPubSubEventBus {
    fn publish(&self, message: OutboundEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(&message).map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| BusError::Transport(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<OutboundEvent> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    warn!(%channel, error = %err, "redis subscribe: connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                warn!(%channel, error = %err, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: OutboundEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        warn!(%channel, error = %err, "dropping undecodable outbound event");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
