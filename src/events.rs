//! Event production and container log shipping
//!
//! Every lifecycle and status change the manager cares about is encoded as
//! a compact binary `{event_name, agent_id, args}` record and both appended
//! to the `events.prodcons` list and published on the `events.pubsub`
//! channel. Container logs are chunked into bounded list records.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::bus::{BusError, MessageBus};
use crate::types::{ContainerId, KernelId};

pub const EVENTS_LIST_KEY: &str = "events.prodcons";
pub const EVENTS_CHANNEL: &str = "events.pubsub";

/// Safety cap so undelivered log chunks do not pile up in the store.
pub const CONTAINER_LOG_TTL: Duration = Duration::from_secs(3600);

#[derive(Serialize)]
struct EventEnvelope<'a> {
    event_name: &'a str,
    agent_id: &'a str,
    args: &'a [serde_json::Value],
}

/// Encoder/publisher of agent events.
pub struct EventProducer {
    bus: Arc<dyn MessageBus>,
    agent_id: String,
    /// Serializes the append-and-publish pair so list order and channel
    /// order agree across tasks.
    producer_lock: tokio::sync::Mutex<()>,
    log_heartbeats: bool,
}

impl EventProducer {
    pub fn new(bus: Arc<dyn MessageBus>, agent_id: impl Into<String>, log_heartbeats: bool) -> Self {
        Self {
            bus,
            agent_id: agent_id.into(),
            producer_lock: tokio::sync::Mutex::new(()),
            log_heartbeats,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Encode and send one event to the manager(s).
    pub async fn produce_event(
        &self,
        event_name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<(), BusError> {
        if event_name == "instance_heartbeat" {
            if self.log_heartbeats {
                debug!("produce_event({})", event_name);
            }
        } else if event_name.starts_with("kernel_") && !args.is_empty() {
            info!("produce_event({}, k:{})", event_name, args[0]);
        } else {
            info!("produce_event({})", event_name);
        }

        let envelope = EventEnvelope {
            event_name,
            agent_id: &self.agent_id,
            args: &args,
        };
        let encoded =
            rmp_serde::to_vec_named(&envelope).map_err(|e| BusError::Encode(e.to_string()))?;

        let _guard = self.producer_lock.lock().await;
        self.bus
            .push_and_publish(EVENTS_LIST_KEY, EVENTS_CHANNEL, encoded)
            .await
    }

    /// Drain a container's log stream into bounded chunk records under
    /// `containerlog.<container-id>`, then announce `kernel_log`.
    pub async fn ship_container_logs(
        &self,
        kernel_id: &KernelId,
        container_id: &ContainerId,
        chunk_size: usize,
        mut source: BoxStream<'_, Bytes>,
    ) -> Result<(), BusError> {
        let log_key = format!("containerlog.{}", container_id);
        let mut buffer = BytesMut::new();
        while let Some(fragment) = source.next().await {
            buffer.extend_from_slice(&fragment);
            while buffer.len() >= chunk_size {
                let chunk = buffer.split_to(chunk_size);
                self.bus.push(&log_key, chunk.to_vec()).await?;
            }
        }
        if !buffer.is_empty() {
            self.bus.push(&log_key, buffer.to_vec()).await?;
        }
        self.bus.expire(&log_key, CONTAINER_LOG_TTL).await?;
        self.produce_event(
            "kernel_log",
            vec![
                serde_json::json!(kernel_id.as_str()),
                serde_json::json!(container_id.as_str()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use futures_util::stream;

    fn producer(bus: Arc<MemoryBus>) -> EventProducer {
        EventProducer::new(bus, "i-test", false)
    }

    fn fragments(parts: &[&[u8]]) -> BoxStream<'static, Bytes> {
        let owned: Vec<Bytes> = parts.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        stream::iter(owned).boxed()
    }

    #[tokio::test]
    async fn test_event_encoding() {
        let bus = Arc::new(MemoryBus::new());
        let producer = producer(bus.clone());
        producer
            .produce_event(
                "kernel_terminated",
                vec![serde_json::json!("k1"), serde_json::json!("self-terminated")],
            )
            .await
            .unwrap();

        let listed = bus.list(EVENTS_LIST_KEY);
        let published = bus.published(EVENTS_CHANNEL);
        assert_eq!(listed.len(), 1);
        // Same payload on both sides of the pipeline.
        assert_eq!(listed, published);

        let decoded: serde_json::Value = rmp_serde::from_slice(&listed[0]).unwrap();
        assert_eq!(decoded["event_name"], "kernel_terminated");
        assert_eq!(decoded["agent_id"], "i-test");
        assert_eq!(decoded["args"][0], "k1");
        assert_eq!(decoded["args"][1], "self-terminated");
    }

    #[tokio::test]
    async fn test_log_chunking_across_fragments() {
        let bus = Arc::new(MemoryBus::new());
        let producer = producer(bus.clone());
        let kernel_id = KernelId::from("k1");
        let container_id = ContainerId::from("c1");

        // 10 bytes in fragments of 4+4+2 with chunk size 6 -> 6 + 4 tail.
        producer
            .ship_container_logs(
                &kernel_id,
                &container_id,
                6,
                fragments(&[b"aaaa", b"bbbb", b"cc"]),
            )
            .await
            .unwrap();

        let chunks = bus.list("containerlog.c1");
        assert_eq!(chunks, vec![b"aaaabb".to_vec(), b"bbcc".to_vec()]);
        assert_eq!(bus.ttl("containerlog.c1"), Some(CONTAINER_LOG_TTL));
    }

    #[tokio::test]
    async fn test_log_exact_chunk_no_spurious_tail() {
        let bus = Arc::new(MemoryBus::new());
        let producer = producer(bus.clone());
        producer
            .ship_container_logs(
                &KernelId::from("k1"),
                &ContainerId::from("c2"),
                4,
                fragments(&[b"abcd"]),
            )
            .await
            .unwrap();

        assert_eq!(bus.list("containerlog.c2"), vec![b"abcd".to_vec()]);
    }

    #[tokio::test]
    async fn test_log_shipping_emits_kernel_log_event() {
        let bus = Arc::new(MemoryBus::new());
        let producer = producer(bus.clone());
        producer
            .ship_container_logs(
                &KernelId::from("k1"),
                &ContainerId::from("c3"),
                16,
                fragments(&[b"hi"]),
            )
            .await
            .unwrap();

        let events = bus.list(EVENTS_LIST_KEY);
        assert_eq!(events.len(), 1);
        let decoded: serde_json::Value = rmp_serde::from_slice(&events[0]).unwrap();
        assert_eq!(decoded["event_name"], "kernel_log");
        assert_eq!(decoded["args"][1], "c3");
    }
}
