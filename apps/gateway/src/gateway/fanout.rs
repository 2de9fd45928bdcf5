//! Cross-instance publish/subscribe bridge.
//!
//! Rooms publish framed messages to namespaced channels and subscribe on
//! behalf of their sessions. [`RedisBus`] connects gateway processes;
//! [`MemoryBus`] serves a single process and the test suite.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use marquee_common::InstanceId;
use marquee_protocol::Packet;
use thiserror::Error;
use tokio::sync::broadcast;

/// Per-channel buffer for the in-process bus. Slow subscribers that fall
/// behind skip messages.
const MEMORY_CHANNEL_CAPACITY: usize = 1024;

pub fn user_channel(user_id: &str) -> String {
    format!("user-events:{user_id}")
}

pub fn theater_channel(theater_id: &str) -> String {
    format!("theater-events:{theater_id}")
}

/// Whether `frame` was published by the instance `origin`. Frames that do
/// not decode count as foreign.
pub fn published_by(frame: &Bytes, origin: &InstanceId) -> bool {
    Packet::decode(frame.clone()).is_ok_and(|packet| packet.header().origin == origin.as_str())
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Stream of payloads published to one channel.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    channel: String,
    stream: BoxStream<'static, Bytes>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the bus side has gone away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.stream.next().await
    }
}

/// Best-effort pub/sub transport.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), FanoutError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, FanoutError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels with at least one live subscription.
    pub fn active_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.value().receiver_count() > 0)
            .count()
    }
}

#[async_trait]
impl FanoutBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), FanoutError> {
        let delivered = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).is_ok(),
            None => return Ok(()),
        };
        if !delivered {
            self.channels
                .remove_if(channel, |_, tx| tx.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, FanoutError> {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .subscribe();

        let name = channel.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %name, skipped, "subscription lagged behind bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Subscription {
            channel: channel.to_string(),
            stream: stream.boxed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis pub/sub. Publishes share one managed connection; every subscription
/// owns a dedicated pub/sub connection that closes when it is dropped.
pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, FanoutError> {
        let client = redis::Client::open(url)?;
        let publisher = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), FanoutError> {
        use redis::AsyncCommands;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, payload.as_ref()).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, FanoutError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));

        Ok(Subscription {
            channel: channel.to_string(),
            stream: stream.boxed(),
        })
    }
}
