//! Cross-instance message broker
//!
//! Best-effort, at-most-once pub/sub fan-out between server instances.
//! Subscribers always apply echo suppression: a frame whose origin equals
//! the local instance id is ignored, because the originating instance has
//! already delivered locally.

mod memory;
mod redis;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::config::Backend;
use crate::error::FabricError;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

/// Callback invoked with the raw payload of every frame on a subscribed
/// topic. Handlers run on the shared pool, never on a connection's writer.
pub type BrokerHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registered handler set, keyed by topic then subscription id.
pub(crate) type HandlerRegistry = Arc<RwLock<HashMap<String, HashMap<u64, BrokerHandler>>>>;

/// Returned by `subscribe`; required to unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionToken {
    pub(crate) topic: String,
    pub(crate) id: u64,
}

impl SubscriptionToken {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, topic: &str, handler: BrokerHandler) -> Result<SubscriptionToken, FabricError>;
    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), FabricError>;
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), FabricError>;

    /// Release background resources. Called once at server shutdown.
    async fn close(&self) {}
}

/// The exact topic taxonomy the fabric uses. Nothing else is ever published.
pub mod topics {
    /// Every connection in the cluster.
    pub const GLOBAL: &str = "broker:wss:global";

    /// One room's fan-out.
    pub fn room(ns: &str, room: &str) -> String {
        format!("broker:{ns}:room:{room}")
    }

    /// All connections of one user in one namespace.
    pub fn user(ns: &str, user_id: &str) -> String {
        format!("broker:{ns}:user:{user_id}")
    }

    /// All connections in one namespace.
    pub fn namespace_global(ns: &str) -> String {
        format!("broker:{ns}:global")
    }
}

/// Build the configured backend.
pub async fn create(
    backend: Backend,
    redis_url: &str,
    op_timeout: std::time::Duration,
) -> anyhow::Result<Arc<dyn Broker>> {
    match backend {
        Backend::Memory => Ok(Arc::new(MemoryBroker::new())),
        Backend::Redis => Ok(Arc::new(RedisBroker::connect(redis_url, op_timeout).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_taxonomy() {
        assert_eq!(topics::room("chat", "lobby"), "broker:chat:room:lobby");
        assert_eq!(topics::user("chat", "u1"), "broker:chat:user:u1");
        assert_eq!(topics::namespace_global("chat"), "broker:chat:global");
        assert_eq!(topics::GLOBAL, "broker:wss:global");
    }
}
