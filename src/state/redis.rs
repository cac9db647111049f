//! Redis state store
//!
//! Persists the membership catalogue in the shared key layout (see
//! [`super::keys`]) so any instance, and recovery tooling, can read it.
//! Room metadata is advisory and lives with the instance that declared the
//! room; the catalogue sets are the authoritative rows.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::envelope::InstanceId;
use crate::error::FabricError;

use super::{keys, ClientRecord, StateResult, StateStore};

fn store_err(e: redis::RedisError) -> FabricError {
    FabricError::State(e.to_string())
}

pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn scan_keys(&self, pattern: &str) -> StateResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }

    async fn read_client(&self, connection_id: Uuid) -> StateResult<Option<ClientRecord>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(keys::connection(connection_id))
            .await
            .map_err(store_err)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| FabricError::State(format!("corrupt client record: {e}"))),
            None => Ok(None),
        }
    }

    async fn write_client(&self, record: &ClientRecord) -> StateResult<()> {
        let mut conn = self.conn();
        let json =
            serde_json::to_string(record).map_err(|e| FabricError::State(e.to_string()))?;
        let _: () = conn
            .set(keys::connection(record.connection_id), json)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Undo every row a connection owns. Shared by `remove_client` and
    /// `clear_instance_data`.
    async fn detach_client(&self, connection_id: Uuid) -> StateResult<()> {
        let Some(record) = self.read_client(connection_id).await? else {
            return Ok(());
        };
        let mut conn = self.conn();
        let id = connection_id.to_string();
        for room in &record.rooms {
            let _: () = conn
                .srem(keys::room_members(&record.namespace, room), &id)
                .await
                .map_err(store_err)?;
        }
        let _: () = conn
            .srem(keys::user_connections(&record.user_id), &id)
            .await
            .map_err(store_err)?;
        let _: () = conn
            .srem(keys::instance_connections(record.instance_id.as_str()), &id)
            .await
            .map_err(store_err)?;
        let _: () = conn
            .del(keys::connection(connection_id))
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn add_namespace(&self, name: &str, meta: &serde_json::Value) -> StateResult<()> {
        let mut conn = self.conn();
        let _: bool = conn
            .set_nx(keys::namespace(name), meta.to_string())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> StateResult<Option<serde_json::Value>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys::namespace(name)).await.map_err(store_err)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| FabricError::State(format!("corrupt namespace meta: {e}"))),
            None => Ok(None),
        }
    }

    async fn list_namespaces(&self) -> StateResult<Vec<String>> {
        // `ns:<name>` has exactly one separator; deeper keys belong to rooms.
        let mut names: Vec<String> = self
            .scan_keys("ns:*")
            .await?
            .into_iter()
            .filter(|key| key.matches(':').count() == 1)
            .filter_map(|key| key.strip_prefix("ns:").map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_namespace(&self, name: &str) -> StateResult<()> {
        let mut conn = self.conn();
        let rooms: usize = conn
            .scard(keys::namespace_rooms(name))
            .await
            .map_err(store_err)?;
        if rooms > 0 {
            return Err(FabricError::Conflict(format!("namespace '{name}' is not empty")));
        }
        let _: () = conn
            .del(vec![keys::namespace(name), keys::namespace_rooms(name)])
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn add_room(&self, ns: &str, name: &str, _meta: &serde_json::Value) -> StateResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .sadd(keys::namespace_rooms(ns), name)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn remove_room(&self, ns: &str, name: &str) -> StateResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .srem(keys::namespace_rooms(ns), name)
            .await
            .map_err(store_err)?;
        let _: () = conn
            .del(keys::room_members(ns, name))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_rooms(&self, ns: &str) -> StateResult<Vec<String>> {
        let mut conn = self.conn();
        let mut rooms: Vec<String> = conn
            .smembers(keys::namespace_rooms(ns))
            .await
            .map_err(store_err)?;
        rooms.sort();
        Ok(rooms)
    }

    async fn room_exists(&self, ns: &str, name: &str) -> StateResult<bool> {
        let mut conn = self.conn();
        conn.sismember(keys::namespace_rooms(ns), name)
            .await
            .map_err(store_err)
    }

    async fn add_client(&self, client: &ClientRecord) -> StateResult<()> {
        self.write_client(client).await?;
        let mut conn = self.conn();
        let id = client.connection_id.to_string();
        let _: () = conn
            .sadd(keys::user_connections(&client.user_id), &id)
            .await
            .map_err(store_err)?;
        let _: () = conn
            .sadd(keys::instance_connections(client.instance_id.as_str()), &id)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn remove_client(&self, connection_id: Uuid) -> StateResult<()> {
        self.detach_client(connection_id).await
    }

    async fn get_clients_by_user(&self, user_id: &str) -> StateResult<Vec<ClientRecord>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(keys::user_connections(user_id))
            .await
            .map_err(store_err)?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(uuid) = id.parse::<Uuid>() else {
                continue;
            };
            if let Some(record) = self.read_client(uuid).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn get_all_clients(&self) -> StateResult<Vec<ClientRecord>> {
        let keys = self.scan_keys("conn:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw_id) = key.strip_prefix("conn:") else {
                continue;
            };
            let Ok(uuid) = raw_id.parse::<Uuid>() else {
                continue;
            };
            if let Some(record) = self.read_client(uuid).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn add_user_to_room(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .sadd(keys::room_members(ns, room), connection_id.to_string())
            .await
            .map_err(store_err)?;
        // The owning instance is the only writer of this blob.
        if let Some(mut record) = self.read_client(connection_id).await? {
            if !record.rooms.iter().any(|r| r == room) {
                record.rooms.push(room.to_string());
                self.write_client(&record).await?;
            }
        }
        Ok(())
    }

    async fn remove_user_from_room(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .srem(keys::room_members(ns, room), connection_id.to_string())
            .await
            .map_err(store_err)?;
        if let Some(mut record) = self.read_client(connection_id).await? {
            if record.rooms.iter().any(|r| r == room) {
                record.rooms.retain(|r| r != room);
                self.write_client(&record).await?;
            }
        }
        Ok(())
    }

    async fn get_clients_in_room(&self, ns: &str, room: &str) -> StateResult<Vec<Uuid>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(keys::room_members(ns, room))
            .await
            .map_err(store_err)?;
        Ok(ids.into_iter().filter_map(|id| id.parse().ok()).collect())
    }

    async fn get_user_rooms(&self, ns: &str, connection_id: Uuid) -> StateResult<Vec<String>> {
        Ok(self
            .read_client(connection_id)
            .await?
            .filter(|record| record.namespace == ns)
            .map(|record| record.rooms)
            .unwrap_or_default())
    }

    async fn is_member(&self, ns: &str, room: &str, connection_id: Uuid) -> StateResult<bool> {
        let mut conn = self.conn();
        conn.sismember(keys::room_members(ns, room), connection_id.to_string())
            .await
            .map_err(store_err)
    }

    async fn count_clients_in_room(&self, ns: &str, room: &str) -> StateResult<usize> {
        let mut conn = self.conn();
        conn.scard(keys::room_members(ns, room))
            .await
            .map_err(store_err)
    }

    async fn clear_instance_data(&self, instance_id: &InstanceId) -> StateResult<()> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(keys::instance_connections(instance_id.as_str()))
            .await
            .map_err(store_err)?;
        for id in ids {
            if let Ok(uuid) = id.parse::<Uuid>() {
                self.detach_client(uuid).await?;
            }
        }
        let _: () = conn
            .del(keys::instance_connections(instance_id.as_str()))
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
