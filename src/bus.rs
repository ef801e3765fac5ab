//! Message bus abstraction
//!
//! The manager-facing side effects of the agent travel over a small bus
//! interface: list pushes, channel publishes, and key expiry. The production
//! implementation talks to Redis with retrying semantics; tests use the
//! in-memory bus.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("payload encoding failed: {0}")]
    Encode(String),
}

/// Narrow interface to the pub/sub + list message store.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Right-push onto a list and publish the same payload to a channel, in
    /// one pipelined round-trip.
    async fn push_and_publish(
        &self,
        list: &str,
        channel: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Right-push a payload onto a list.
    async fn push(&self, list: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Cap the lifetime of a key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BusError>;
}

/// Redis-backed bus with exponential-backoff retries around every operation.
pub struct RedisBus {
    connection: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        info!("Connecting message bus to {}", url);
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Message bus connected");
        Ok(Self { connection })
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn push_and_publish(
        &self,
        list: &str,
        channel: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        backoff::future::retry(Self::retry_policy(), || {
            let mut conn = self.connection.clone();
            let payload = payload.clone();
            async move {
                let mut pipe = redis::pipe();
                pipe.rpush(list, payload.as_slice())
                    .publish(channel, payload.as_slice());
                let result: Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;
                result.map_err(backoff::Error::transient)
            }
        })
        .await
        .map_err(BusError::Redis)
    }

    async fn push(&self, list: &str, payload: Vec<u8>) -> Result<(), BusError> {
        backoff::future::retry(Self::retry_policy(), || {
            let mut conn = self.connection.clone();
            let payload = payload.clone();
            async move {
                let result: Result<(), redis::RedisError> = redis::cmd("RPUSH")
                    .arg(list)
                    .arg(payload.as_slice())
                    .query_async(&mut conn)
                    .await;
                result.map_err(backoff::Error::transient)
            }
        })
        .await
        .map_err(BusError::Redis)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BusError> {
        backoff::future::retry(Self::retry_policy(), || {
            let mut conn = self.connection.clone();
            async move {
                let result: Result<(), redis::RedisError> = redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl.as_secs())
                    .query_async(&mut conn)
                    .await;
                result.map_err(backoff::Error::transient)
            }
        })
        .await
        .map_err(BusError::Redis)
    }
}

/// In-memory bus capturing every operation; the test double for the agent
/// and shipper tests.
#[derive(Default)]
pub struct MemoryBus {
    state: parking_lot::Mutex<MemoryBusState>,
}

#[derive(Default)]
struct MemoryBusState {
    lists: std::collections::HashMap<String, Vec<Vec<u8>>>,
    published: Vec<(String, Vec<u8>)>,
    ttls: std::collections::HashMap<String, Duration>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, key: &str) -> Vec<Vec<u8>> {
        self.state.lock().lists.get(key).cloned().unwrap_or_default()
    }

    pub fn published(&self, channel: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.state.lock().ttls.get(key).copied()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn push_and_publish(
        &self,
        list: &str,
        channel: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state
            .lists
            .entry(list.to_string())
            .or_default()
            .push(payload.clone());
        state.published.push((channel.to_string(), payload));
        Ok(())
    }

    async fn push(&self, list: &str, payload: Vec<u8>) -> Result<(), BusError> {
        debug!(list, len = payload.len(), "memory bus push");
        self.state
            .lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push(payload);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BusError> {
        self.state.lock().ttls.insert(key.to_string(), ttl);
        Ok(())
    }
}
