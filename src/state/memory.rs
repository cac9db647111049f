//! In-memory state store
//!
//! Single-process backend used in development and tests. Several server
//! instances inside one process may share it to simulate a cluster.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::envelope::InstanceId;
use crate::error::FabricError;

use super::{ClientRecord, StateResult, StateStore};

#[derive(Default)]
struct Inner {
    namespaces: HashMap<String, serde_json::Value>,
    /// ns -> room -> meta
    rooms: HashMap<String, HashMap<String, serde_json::Value>>,
    clients: HashMap<Uuid, ClientRecord>,
    /// (ns, room) -> member connection ids
    members: HashMap<(String, String), HashSet<Uuid>>,
    user_conns: HashMap<String, HashSet<Uuid>>,
    instance_conns: HashMap<String, HashSet<Uuid>>,
}

impl Inner {
    fn detach_client(&mut self, connection_id: Uuid) {
        let Some(record) = self.clients.remove(&connection_id) else {
            return;
        };
        for room in &record.rooms {
            if let Some(set) = self.members.get_mut(&(record.namespace.clone(), room.clone())) {
                set.remove(&connection_id);
                if set.is_empty() {
                    self.members.remove(&(record.namespace.clone(), room.clone()));
                }
            }
        }
        if let Some(set) = self.user_conns.get_mut(&record.user_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                self.user_conns.remove(&record.user_id);
            }
        }
        if let Some(set) = self.instance_conns.get_mut(record.instance_id.as_str()) {
            set.remove(&connection_id);
            if set.is_empty() {
                self.instance_conns.remove(record.instance_id.as_str());
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn add_namespace(&self, name: &str, meta: &serde_json::Value) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        inner.namespaces.entry(name.to_string()).or_insert_with(|| meta.clone());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> StateResult<Option<serde_json::Value>> {
        Ok(self.inner.read().await.namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self) -> StateResult<Vec<String>> {
        let mut names: Vec<String> = self.inner.read().await.namespaces.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn remove_namespace(&self, name: &str) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        if inner.rooms.get(name).is_some_and(|rooms| !rooms.is_empty()) {
            return Err(FabricError::Conflict(format!("namespace '{name}' is not empty")));
        }
        inner.namespaces.remove(name);
        inner.rooms.remove(name);
        Ok(())
    }

    async fn add_room(&self, ns: &str, name: &str, meta: &serde_json::Value) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .rooms
            .entry(ns.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| meta.clone());
        Ok(())
    }

    async fn remove_room(&self, ns: &str, name: &str) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(rooms) = inner.rooms.get_mut(ns) {
            rooms.remove(name);
        }
        inner.members.remove(&(ns.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_rooms(&self, ns: &str) -> StateResult<Vec<String>> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner
            .rooms
            .get(ns)
            .map(|rooms| rooms.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn room_exists(&self, ns: &str, name: &str) -> StateResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner.rooms.get(ns).is_some_and(|rooms| rooms.contains_key(name)))
    }

    async fn add_client(&self, client: &ClientRecord) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .user_conns
            .entry(client.user_id.clone())
            .or_default()
            .insert(client.connection_id);
        inner
            .instance_conns
            .entry(client.instance_id.as_str().to_string())
            .or_default()
            .insert(client.connection_id);
        inner.clients.insert(client.connection_id, client.clone());
        Ok(())
    }

    async fn remove_client(&self, connection_id: Uuid) -> StateResult<()> {
        self.inner.write().await.detach_client(connection_id);
        Ok(())
    }

    async fn get_clients_by_user(&self, user_id: &str) -> StateResult<Vec<ClientRecord>> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.user_conns.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| inner.clients.get(id).cloned()).collect())
    }

    async fn get_all_clients(&self) -> StateResult<Vec<ClientRecord>> {
        Ok(self.inner.read().await.clients.values().cloned().collect())
    }

    async fn add_user_to_room(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .members
            .entry((ns.to_string(), room.to_string()))
            .or_default()
            .insert(connection_id);
        if let Some(record) = inner.clients.get_mut(&connection_id) {
            if !record.rooms.iter().any(|r| r == room) {
                record.rooms.push(room.to_string());
            }
        }
        Ok(())
    }

    async fn remove_user_from_room(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(set) = inner.members.get_mut(&(ns.to_string(), room.to_string())) {
            set.remove(&connection_id);
            if set.is_empty() {
                inner.members.remove(&(ns.to_string(), room.to_string()));
            }
        }
        if let Some(record) = inner.clients.get_mut(&connection_id) {
            record.rooms.retain(|r| r != room);
        }
        Ok(())
    }

    async fn get_clients_in_room(&self, ns: &str, room: &str) -> StateResult<Vec<Uuid>> {
        let inner = self.inner.read().await;
        Ok(inner
            .members
            .get(&(ns.to_string(), room.to_string()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_user_rooms(&self, ns: &str, connection_id: Uuid) -> StateResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .clients
            .get(&connection_id)
            .filter(|record| record.namespace == ns)
            .map(|record| record.rooms.clone())
            .unwrap_or_default())
    }

    async fn is_member(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .members
            .get(&(ns.to_string(), room.to_string()))
            .is_some_and(|set| set.contains(&connection_id)))
    }

    async fn count_clients_in_room(&self, ns: &str, room: &str) -> StateResult<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .members
            .get(&(ns.to_string(), room.to_string()))
            .map(|set| set.len())
            .unwrap_or(0))
    }

    async fn clear_instance_data(&self, instance_id: &InstanceId) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        let ids: Vec<Uuid> = inner
            .instance_conns
            .get(instance_id.as_str())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            inner.detach_client(id);
        }
        inner.instance_conns.remove(instance_id.as_str());
        Ok(())
    }
}
