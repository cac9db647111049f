//! In-process broker
//!
//! Dispatches directly to the registered handlers. Several server instances
//! in one process can share a single `MemoryBroker` to exercise the full
//! cross-instance path (publish, receipt, echo suppression) in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::FabricError;

use super::{Broker, BrokerHandler, HandlerRegistry, SubscriptionToken};

#[derive(Default)]
pub struct MemoryBroker {
    handlers: HandlerRegistry,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live subscriptions on a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(topic)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<SubscriptionToken, FabricError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(id, handler);
        Ok(SubscriptionToken {
            topic: topic.to_string(),
            id,
        })
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), FabricError> {
        let mut handlers = self.handlers.write().await;
        if let Some(map) = handlers.get_mut(&token.topic) {
            map.remove(&token.id);
            if map.is_empty() {
                handlers.remove(&token.topic);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), FabricError> {
        // Snapshot first so no lock is held while handlers run. Handlers are
        // awaited in registration order, preserving per-topic FIFO for a
        // single publisher.
        let snapshot: Vec<BrokerHandler> = {
            let handlers = self.handlers.read().await;
            handlers
                .get(topic)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            handler(payload.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler(seen: Arc<Mutex<Vec<Bytes>>>) -> BrokerHandler {
        Arc::new(move |payload| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(payload);
            })
        })
    }

    #[tokio::test]
    async fn delivers_to_topic_subscribers_only() {
        let broker = MemoryBroker::new();
        let on_a = Arc::new(Mutex::new(Vec::new()));
        let on_b = Arc::new(Mutex::new(Vec::new()));

        broker.subscribe("topic:a", recording_handler(on_a.clone())).await.unwrap();
        broker.subscribe("topic:b", recording_handler(on_b.clone())).await.unwrap();

        broker.publish("topic:a", Bytes::from_static(b"one")).await.unwrap();
        broker.publish("topic:a", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(on_a.lock().unwrap().len(), 2);
        assert!(on_b.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preserves_publish_order() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        broker.subscribe("t", recording_handler(seen.clone())).await.unwrap();

        for n in 0u8..10 {
            broker.publish("t", Bytes::from(vec![n])).await.unwrap();
        }

        let seen = seen.lock().unwrap();
        let order: Vec<u8> = seen.iter().map(|p| p[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = broker.subscribe("t", recording_handler(seen.clone())).await.unwrap();

        broker.publish("t", Bytes::from_static(b"before")).await.unwrap();
        broker.unsubscribe(token).await.unwrap();
        broker.publish("t", Bytes::from_static(b"after")).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(broker.subscriber_count("t").await, 0);
    }
}
