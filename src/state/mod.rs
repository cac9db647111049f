//! Cluster state store
//!
//! The authoritative, cluster-wide view of membership: which namespaces and
//! rooms exist, which connections are alive, and who is in which room.
//! Local `Server`/`Namespace`/`Room` structures only cache what lives on the
//! current instance; fan-out never relies on the store as a delivery path
//! (that is the broker's job).
//!
//! Reads are monotonic within one instance; cross-instance reads are
//! eventually consistent. All mutations are atomic per key with set
//! semantics (a repeated add is a no-op). Transient failures propagate to
//! the caller, which retries with bounded back-off.

mod memory;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Backend;
use crate::envelope::InstanceId;
use crate::error::FabricError;

pub use memory::MemoryStateStore;
pub use redis::RedisStateStore;

pub type StateResult<T> = Result<T, FabricError>;

/// One connection's row in the store. The `rooms` list rides inside the
/// `conn:<id>` meta blob so recovery can undo memberships without extra
/// index keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub connection_id: Uuid,
    pub instance_id: InstanceId,
    pub user_id: String,
    pub display_name: String,
    pub namespace: String,
    #[serde(default)]
    pub rooms: Vec<String>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // Namespace catalogue
    async fn add_namespace(&self, name: &str, meta: &serde_json::Value) -> StateResult<()>;
    async fn get_namespace(&self, name: &str) -> StateResult<Option<serde_json::Value>>;
    async fn list_namespaces(&self) -> StateResult<Vec<String>>;
    /// Fails with a non-retryable conflict when the namespace still has rooms.
    async fn remove_namespace(&self, name: &str) -> StateResult<()>;

    // Room catalogue
    async fn add_room(&self, ns: &str, name: &str, meta: &serde_json::Value) -> StateResult<()>;
    async fn remove_room(&self, ns: &str, name: &str) -> StateResult<()>;
    async fn get_rooms(&self, ns: &str) -> StateResult<Vec<String>>;
    async fn room_exists(&self, ns: &str, name: &str) -> StateResult<bool>;

    // Client catalogue
    async fn add_client(&self, client: &ClientRecord) -> StateResult<()>;
    async fn remove_client(&self, connection_id: Uuid) -> StateResult<()>;
    async fn get_clients_by_user(&self, user_id: &str) -> StateResult<Vec<ClientRecord>>;
    async fn get_all_clients(&self) -> StateResult<Vec<ClientRecord>>;

    // Room membership
    async fn add_user_to_room(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<()>;
    async fn remove_user_from_room(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<()>;
    async fn get_clients_in_room(&self, ns: &str, room: &str) -> StateResult<Vec<Uuid>>;
    async fn get_user_rooms(&self, ns: &str, connection_id: Uuid) -> StateResult<Vec<String>>;
    async fn is_member(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<bool>;
    async fn count_clients_in_room(&self, ns: &str, room: &str) -> StateResult<usize>;

    /// Idempotent purge of every row tagged with the given instance. Used at
    /// graceful shutdown and as the crash-recovery action.
    async fn clear_instance_data(&self, instance_id: &InstanceId) -> StateResult<()>;
}

/// Logical key layout shared by external backends. Namespace and room names
/// never contain `:`, so the segments parse back unambiguously.
pub mod keys {
    use uuid::Uuid;

    #[inline]
    pub fn namespace(name: &str) -> String {
        format!("ns:{name}")
    }

    #[inline]
    pub fn namespace_rooms(ns: &str) -> String {
        format!("ns:{ns}:rooms")
    }

    #[inline]
    pub fn room_members(ns: &str, room: &str) -> String {
        format!("ns:{ns}:room:{room}:members")
    }

    #[inline]
    pub fn connection(id: Uuid) -> String {
        format!("conn:{id}")
    }

    #[inline]
    pub fn user_connections(user_id: &str) -> String {
        format!("user:{user_id}:conns")
    }

    #[inline]
    pub fn instance_connections(instance_id: &str) -> String {
        format!("instance:{instance_id}:conns")
    }
}

/// Build the configured backend.
pub async fn create(backend: Backend, redis_url: &str) -> anyhow::Result<Arc<dyn StateStore>> {
    match backend {
        Backend::Memory => Ok(Arc::new(MemoryStateStore::new())),
        Backend::Redis => Ok(Arc::new(RedisStateStore::connect(redis_url).await?)),
    }
}
