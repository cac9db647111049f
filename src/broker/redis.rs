//! Redis pub/sub broker
//!
//! One background task owns the pub/sub connection. Subscribe/unsubscribe
//! requests reach it over a command channel so the subscriber set is never
//! mutated concurrently, and the registered topic set is replayed in full
//! whenever the connection is re-established.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, RwLock};

use crate::error::FabricError;

use super::{Broker, BrokerHandler, HandlerRegistry, SubscriptionToken};

enum PubSubCommand {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

pub struct RedisBroker {
    publisher: ConnectionManager,
    handlers: HandlerRegistry,
    next_id: AtomicU64,
    commands: mpsc::UnboundedSender<PubSubCommand>,
    op_timeout: Duration,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let handlers: HandlerRegistry = Arc::new(RwLock::new(HashMap::new()));

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(subscription_loop(client, handlers.clone(), command_rx));

        Ok(Self {
            publisher,
            handlers,
            next_id: AtomicU64::new(1),
            commands,
            op_timeout,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<SubscriptionToken, FabricError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let newly_subscribed = {
            let mut handlers = self.handlers.write().await;
            let entry = handlers.entry(topic.to_string()).or_default();
            let first = entry.is_empty();
            entry.insert(id, handler);
            first
        };
        if newly_subscribed {
            self.commands
                .send(PubSubCommand::Subscribe(topic.to_string()))
                .map_err(|_| FabricError::Broker("pub/sub task gone".into()))?;
        }
        Ok(SubscriptionToken {
            topic: topic.to_string(),
            id,
        })
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), FabricError> {
        let topic_drained = {
            let mut handlers = self.handlers.write().await;
            match handlers.get_mut(&token.topic) {
                Some(map) => {
                    map.remove(&token.id);
                    if map.is_empty() {
                        handlers.remove(&token.topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if topic_drained {
            self.commands
                .send(PubSubCommand::Unsubscribe(token.topic))
                .map_err(|_| FabricError::Broker("pub/sub task gone".into()))?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), FabricError> {
        let mut conn = self.publisher.clone();
        let publish = async move {
            let _: () = conn
                .publish(topic, payload.as_ref())
                .await
                .map_err(|e| FabricError::Broker(e.to_string()))?;
            Ok::<(), FabricError>(())
        };
        tokio::time::timeout(self.op_timeout, publish)
            .await
            .map_err(|_| FabricError::Broker(format!("publish to '{topic}' timed out")))?
    }

    async fn close(&self) {
        let _ = self.commands.send(PubSubCommand::Shutdown);
    }
}

/// Owns the pub/sub connection for the broker's lifetime, re-establishing it
/// (and every registered subscription) whenever the stream drops.
async fn subscription_loop(
    client: redis::Client,
    handlers: HandlerRegistry,
    mut commands: mpsc::UnboundedReceiver<PubSubCommand>,
) {
    let mut reconnect_delay = Duration::from_millis(250);

    loop {
        let pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::warn!(err = %e, "Broker pub/sub connect failed, retrying");
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(5));
                continue;
            }
        };
        reconnect_delay = Duration::from_millis(250);

        let (mut sink, mut stream) = pubsub.split();

        // Restore the full registered topic set after (re)connect.
        let topics: Vec<String> = handlers.read().await.keys().cloned().collect();
        for topic in &topics {
            if let Err(e) = sink.subscribe(topic).await {
                tracing::warn!(topic = %topic, err = %e, "Broker resubscribe failed");
            }
        }
        if !topics.is_empty() {
            tracing::info!(topics = topics.len(), "Broker subscriptions restored");
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PubSubCommand::Subscribe(topic)) => {
                        if let Err(e) = sink.subscribe(&topic).await {
                            tracing::warn!(topic = %topic, err = %e, "Broker subscribe failed");
                        }
                    }
                    Some(PubSubCommand::Unsubscribe(topic)) => {
                        if let Err(e) = sink.unsubscribe(&topic).await {
                            tracing::warn!(topic = %topic, err = %e, "Broker unsubscribe failed");
                        }
                    }
                    Some(PubSubCommand::Shutdown) | None => {
                        tracing::debug!("Broker pub/sub task stopped");
                        return;
                    }
                },
                message = stream.next() => match message {
                    Some(message) => {
                        let topic = message.get_channel_name().to_string();
                        let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                        let snapshot: Vec<BrokerHandler> = {
                            let handlers = handlers.read().await;
                            handlers
                                .get(&topic)
                                .map(|m| m.values().cloned().collect())
                                .unwrap_or_default()
                        };
                        for handler in snapshot {
                            handler(payload.clone()).await;
                        }
                    }
                    None => {
                        tracing::warn!("Broker pub/sub stream ended, reconnecting");
                        break;
                    }
                },
            }
        }
    }
}
