//! Namespace - routing layer between a URL path and a pool of rooms
//! ═══════════════════════════════════════════════════════════════════════════════════
//!
//! A namespace owns the local connections attached under its path, the user
//! index, and the room pool. Inbound frames pass through the middleware
//! chain, then a registered custom handler, then the built-in event set:
//!
//! `room:join`, `room:leave`, `chat:send_message`, `chat:typing_start`,
//! `chat:send_global` (admin), `ping`, `who_am_i`, `list_rooms`.
//!
//! The namespace also mediates its broker subscriptions: one for
//! `broker:<ns>:global`, and one per locally-present user for
//! `broker:<ns>:user:<user_id>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::{topics, BrokerHandler, SubscriptionToken};
use crate::connection::{Connection, ConnectionRegistry};
use crate::envelope::{BrokerFrame, Envelope, InboundFrame, Principal};
use crate::error::FabricError;
use crate::room::{Room, RoomTask, RoomVacancy};
use crate::services::Services;
use crate::state::ClientRecord;

lazy_static! {
    static ref NAMESPACE_NAME_RE: Regex = Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").unwrap();
    static ref ROOM_NAME_RE: Regex = Regex::new(r"^[a-z0-9_-]{3,64}$").unwrap();
}

pub fn valid_namespace_name(name: &str) -> bool {
    NAMESPACE_NAME_RE.is_match(name)
}

pub fn valid_room_name(name: &str) -> bool {
    ROOM_NAME_RE.is_match(name)
}

/// One dispatched event, owned so handlers can run detached.
#[derive(Clone)]
pub struct EventContext {
    pub connection: Arc<Connection>,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Outcome of one middleware step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareFlow {
    Continue,
    /// The middleware answered; the chain and the handlers are skipped.
    Handled,
}

/// A step in the linearly executed middleware chain.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        namespace: &Arc<Namespace>,
        ctx: &EventContext,
    ) -> Result<MiddlewareFlow, FabricError>;
}

/// Registered per-event handler. Receives the namespace and the context and
/// owns nothing else, so it tests as a pure function.
pub type EventHandler =
    Arc<dyn Fn(Arc<Namespace>, EventContext) -> BoxFuture<'static, Result<(), FabricError>> + Send + Sync>;

pub struct Namespace {
    pub name: String,
    pub path: String,
    services: Arc<Services>,
    connections: ConnectionRegistry,
    user_index: RwLock<HashMap<String, HashSet<Uuid>>>,
    user_subs: Mutex<HashMap<String, SubscriptionToken>>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    custom_handlers: RwLock<HashMap<String, EventHandler>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    global_sub: Mutex<Option<SubscriptionToken>>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, services: Arc<Services>) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            path: format!("/{name}"),
            name,
            services,
            connections: Arc::new(RwLock::new(HashMap::new())),
            user_index: RwLock::new(HashMap::new()),
            user_subs: Mutex::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            custom_handlers: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            global_sub: Mutex::new(None),
        })
    }

    /// Catalogue the namespace and attach its global broker subscription.
    /// Called once by the server at registration, before upgrades arrive.
    pub async fn init(self: &Arc<Self>) -> Result<(), FabricError> {
        let meta = serde_json::json!({ "path": self.path });
        let state = self.services.state.clone();
        let name = self.name.clone();
        self.services
            .state_write(|| {
                let state = state.clone();
                let name = name.clone();
                let meta = meta.clone();
                async move { state.add_namespace(&name, &meta).await }
            })
            .await?;

        let weak = Arc::downgrade(self);
        let handler: BrokerHandler = Arc::new(move |payload: Bytes| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(ns) = weak.upgrade() {
                    ns.handle_global_frame(payload).await;
                }
            })
        });
        let token = self
            .services
            .broker
            .subscribe(&topics::namespace_global(&self.name), handler)
            .await?;
        *self.global_sub.lock().await = Some(token);
        Ok(())
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.connections.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<Uuid> = self
            .user_index
            .read()
            .await
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let registry = self.connections.read().await;
        ids.iter().filter_map(|id| registry.get(id).cloned()).collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // CONNECTION LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════

    /// Idempotent registration of a freshly-upgraded connection. A failed
    /// catalogue write is returned so the server can refuse the connection.
    pub async fn add_connection(self: &Arc<Self>, connection: &Arc<Connection>) -> Result<(), FabricError> {
        {
            let mut registry = self.connections.write().await;
            if registry.contains_key(&connection.id) {
                return Ok(());
            }
            registry.insert(connection.id, connection.clone());
        }

        let principal = connection.principal.clone().ok_or_else(|| {
            FabricError::Auth("connection has no principal".into())
        })?;

        let first_of_user = {
            let mut index = self.user_index.write().await;
            let set = index.entry(principal.user_id.clone()).or_default();
            set.insert(connection.id);
            set.len() == 1
        };
        if first_of_user {
            self.subscribe_user_topic(&principal.user_id).await;
        }

        let record = ClientRecord {
            connection_id: connection.id,
            instance_id: connection.instance_id.clone(),
            user_id: principal.user_id.clone(),
            display_name: principal.display_name.clone(),
            namespace: self.name.clone(),
            rooms: Vec::new(),
        };
        let state = self.services.state.clone();
        let result = self
            .services
            .state_write(|| {
                let state = state.clone();
                let record = record.clone();
                async move { state.add_client(&record).await }
            })
            .await;
        if let Err(e) = result {
            tracing::error!(
                namespace = %self.name,
                connection_id = %connection.id,
                user_id = %principal.user_id,
                err = %e,
                "Client catalogue write failed, refusing connection"
            );
            self.detach_locally(connection).await;
            return Err(e);
        }

        tracing::info!(
            namespace = %self.name,
            connection_id = %connection.id,
            user_id = %principal.user_id,
            "Connection registered"
        );
        Ok(())
    }

    /// Remove a connection from every room it joined and from the local
    /// maps, then drop its catalogue rows.
    pub async fn remove_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        for room_name in connection.joined_rooms() {
            let room = self.room(&room_name).await;
            if let Some(room) = room {
                match room.leave(connection).await {
                    Ok(RoomVacancy::ClusterEmpty) if !room.persistent => {
                        self.remove_room(&room_name).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            namespace = %self.name,
                            room = %room_name,
                            connection_id = %connection.id,
                            err = %e,
                            "Leave during removal failed"
                        );
                    }
                }
            }
        }

        self.detach_locally(connection).await;

        let state = self.services.state.clone();
        let id = connection.id;
        let result = self
            .services
            .state_write(|| {
                let state = state.clone();
                async move { state.remove_client(id).await }
            })
            .await;
        if let Err(e) = result {
            tracing::error!(
                namespace = %self.name,
                connection_id = %connection.id,
                err = %e,
                "Client catalogue removal failed after retries"
            );
        }

        tracing::info!(
            namespace = %self.name,
            connection_id = %connection.id,
            "Connection removed"
        );
    }

    async fn detach_locally(&self, connection: &Arc<Connection>) {
        self.connections.write().await.remove(&connection.id);
        if let Some(user_id) = connection.user_id() {
            let last_of_user = {
                let mut index = self.user_index.write().await;
                if let Some(set) = index.get_mut(user_id) {
                    set.remove(&connection.id);
                    if set.is_empty() {
                        index.remove(user_id);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            };
            if last_of_user {
                self.unsubscribe_user_topic(user_id).await;
            }
        }
    }

    async fn subscribe_user_topic(self: &Arc<Self>, user_id: &str) {
        let weak = Arc::downgrade(self);
        let user = user_id.to_string();
        let handler: BrokerHandler = Arc::new(move |payload: Bytes| {
            let weak = weak.clone();
            let user = user.clone();
            Box::pin(async move {
                if let Some(ns) = weak.upgrade() {
                    ns.handle_user_frame(&user, payload).await;
                }
            })
        });
        match self
            .services
            .broker
            .subscribe(&topics::user(&self.name, user_id), handler)
            .await
        {
            Ok(token) => {
                self.user_subs.lock().await.insert(user_id.to_string(), token);
            }
            Err(e) => {
                tracing::warn!(namespace = %self.name, user_id = %user_id, err = %e, "User topic subscribe failed");
            }
        }
    }

    async fn unsubscribe_user_topic(&self, user_id: &str) {
        let token = self.user_subs.lock().await.remove(user_id);
        if let Some(token) = token {
            if let Err(e) = self.services.broker.unsubscribe(token).await {
                tracing::warn!(namespace = %self.name, user_id = %user_id, err = %e, "User topic unsubscribe failed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // ROOMS
    // ═══════════════════════════════════════════════════════════════════

    /// Create the room on first demand. Room names are validated here; a
    /// violation is a protocol error and mutates nothing.
    pub async fn get_or_create_room(
        self: &Arc<Self>,
        name: &str,
        persistent: bool,
    ) -> Result<Arc<Room>, FabricError> {
        if !valid_room_name(name) {
            return Err(FabricError::Protocol(format!("room name invalid: '{name}'")));
        }
        if let Some(room) = self.room(name).await {
            return Ok(room);
        }

        let room = {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(name.to_string())
                .or_insert_with(|| {
                    Room::new(
                        name,
                        self.name.clone(),
                        persistent,
                        self.services.clone(),
                        self.connections.clone(),
                    )
                })
                .clone()
        };

        let state = self.services.state.clone();
        let (ns, room_name) = (self.name.clone(), name.to_string());
        let meta = serde_json::json!({ "persistent": persistent });
        if let Err(e) = self
            .services
            .state_write(|| {
                let state = state.clone();
                let ns = ns.clone();
                let room_name = room_name.clone();
                let meta = meta.clone();
                async move { state.add_room(&ns, &room_name, &meta).await }
            })
            .await
        {
            tracing::warn!(namespace = %self.name, room = %name, err = %e, "Room catalogue write failed");
        }

        tracing::info!(namespace = %self.name, room = %name, persistent, "Room created");
        Ok(room)
    }

    /// Tear a room down locally and drop it from the catalogue. Every local
    /// member's joined flag is cleared first.
    pub async fn remove_room(self: &Arc<Self>, name: &str) {
        let room = self.rooms.write().await.remove(name);
        let Some(room) = room else { return };

        let members = room.local_members().await;
        {
            let registry = self.connections.read().await;
            for id in members {
                if let Some(connection) = registry.get(&id) {
                    connection.note_room_left(name);
                }
            }
        }
        room.destroy().await;

        let state = self.services.state.clone();
        let (ns, room_name) = (self.name.clone(), name.to_string());
        if let Err(e) = self
            .services
            .state_write(|| {
                let state = state.clone();
                let ns = ns.clone();
                let room_name = room_name.clone();
                async move { state.remove_room(&ns, &room_name).await }
            })
            .await
        {
            tracing::warn!(namespace = %self.name, room = %name, err = %e, "Room catalogue removal failed");
        }
        tracing::info!(namespace = %self.name, room = %name, "Room removed");
    }

    /// Periodic backstop for rooms the eager path missed (store hiccups,
    /// crashed peers). Non-persistent, locally idle, cluster-empty rooms
    /// older than one TTL window are removed.
    pub fn spawn_idle_sweep(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let ns = self.clone();
        let ttl = self.services.config.room_idle_ttl;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(ttl) => {}
                }
                let rooms = ns.rooms_snapshot().await;
                let cutoff = chrono::Utc::now().timestamp_millis() - ttl.as_millis() as i64;
                for room in rooms {
                    if room.persistent
                        || room.local_member_count().await > 0
                        || room.last_activity_ms() > cutoff
                    {
                        continue;
                    }
                    let cluster = ns
                        .services
                        .state
                        .count_clients_in_room(&ns.name, &room.name)
                        .await
                        .unwrap_or(1);
                    if cluster == 0 {
                        tracing::debug!(namespace = %ns.name, room = %room.name, "Idle room reaped");
                        ns.remove_room(&room.name).await;
                    }
                }
            }
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // FAN-OUT
    // ═══════════════════════════════════════════════════════════════════

    /// Deliver to every local connection, then publish to the namespace's
    /// global topic for the peers.
    pub async fn broadcast(&self, envelope: Envelope) {
        self.broadcast_local(&envelope).await;
        let frame = BrokerFrame::new(self.services.instance_id.clone(), envelope);
        self.services
            .publish_frame(&topics::namespace_global(&self.name), &frame)
            .await;
    }

    /// Local-only half of [`broadcast`]; also the broker receipt path.
    pub async fn broadcast_local(&self, envelope: &Envelope) {
        let connections = self.connections_snapshot().await;
        for connection in connections {
            if let Err(e) = connection.send(envelope) {
                tracing::debug!(
                    namespace = %self.name,
                    connection_id = %connection.id,
                    err = %e,
                    "Broadcast delivery skipped"
                );
            } else {
                self.services.metrics.record_envelope_out();
            }
        }
    }

    /// Deliver to every local connection of one user, then publish to the
    /// user topic for the peers.
    pub async fn send_to_user(&self, user_id: &str, envelope: Envelope) {
        self.deliver_to_user_local(user_id, &envelope).await;
        let frame = BrokerFrame::new(self.services.instance_id.clone(), envelope);
        self.services
            .publish_frame(&topics::user(&self.name, user_id), &frame)
            .await;
    }

    async fn deliver_to_user_local(&self, user_id: &str, envelope: &Envelope) {
        for connection in self.user_connections(user_id).await {
            if let Err(e) = connection.send(envelope) {
                tracing::debug!(
                    namespace = %self.name,
                    connection_id = %connection.id,
                    user_id = %user_id,
                    err = %e,
                    "User delivery skipped"
                );
            } else {
                self.services.metrics.record_envelope_out();
            }
        }
    }

    async fn handle_global_frame(&self, payload: Bytes) {
        let Some(frame) = self.decode_remote(&payload) else { return };
        self.broadcast_local(&frame.envelope).await;
    }

    async fn handle_user_frame(&self, user_id: &str, payload: Bytes) {
        let Some(frame) = self.decode_remote(&payload) else { return };
        self.deliver_to_user_local(user_id, &frame.envelope).await;
    }

    fn decode_remote(&self, payload: &[u8]) -> Option<BrokerFrame> {
        match BrokerFrame::decode(payload) {
            Ok(frame) if frame.origin == self.services.instance_id => None,
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(namespace = %self.name, err = %e, "Undecodable broker frame dropped");
                None
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // EVENT DISPATCH
    // ═══════════════════════════════════════════════════════════════════

    pub async fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares.write().await.push(middleware);
    }

    pub async fn register_handler(&self, event: &str, handler: EventHandler) {
        self.custom_handlers.write().await.insert(event.to_string(), handler);
    }

    /// Dispatch one inbound frame. Errors never propagate to the socket
    /// raw; they come back as `sys:error` with a coarse code. An exhausted
    /// membership write additionally terminates the connection.
    pub async fn handle_event(self: &Arc<Self>, connection: &Arc<Connection>, frame: InboundFrame) {
        self.services.metrics.record_envelope_in();
        connection.touch_last_action();

        let ctx = EventContext {
            connection: connection.clone(),
            event: frame.event,
            payload: frame.payload,
        };

        if ctx.connection.principal.is_none() {
            self.send_error(connection, &FabricError::Auth("unauthenticated".into())).await;
            return;
        }

        let middlewares: Vec<Arc<dyn Middleware>> = self.middlewares.read().await.clone();
        for middleware in middlewares {
            match middleware.handle(self, &ctx).await {
                Ok(MiddlewareFlow::Continue) => {}
                Ok(MiddlewareFlow::Handled) => return,
                Err(e) => {
                    self.send_error(connection, &e).await;
                    return;
                }
            }
        }

        let custom = self.custom_handlers.read().await.get(&ctx.event).cloned();
        let result = if let Some(handler) = custom {
            handler(self.clone(), ctx.clone()).await
        } else {
            self.dispatch_builtin(&ctx).await
        };

        if let Err(e) = result {
            tracing::warn!(
                namespace = %self.name,
                connection_id = %connection.id,
                user_id = connection.user_id().unwrap_or("-"),
                event = %ctx.event,
                err = %e,
                "Event handling failed"
            );
            self.send_error(connection, &e).await;
            if matches!(e, FabricError::State(_)) {
                // Membership writes exhausted their retries; the local view
                // no longer matches the store.
                connection.terminate();
            }
        }
    }

    async fn dispatch_builtin(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        match ctx.event.as_str() {
            "room:join" => self.handle_room_join(ctx).await,
            "room:leave" => self.handle_room_leave(ctx).await,
            "chat:send_message" => self.handle_send_message(ctx).await,
            "chat:typing_start" => self.handle_typing_start(ctx).await,
            "chat:send_global" => self.handle_send_global(ctx).await,
            "ping" => self.handle_ping(ctx).await,
            "who_am_i" => self.handle_who_am_i(ctx).await,
            "list_rooms" => self.handle_list_rooms(ctx).await,
            other => Err(FabricError::Protocol(format!("unknown event: '{other}'"))),
        }
    }

    fn principal(ctx: &EventContext) -> Result<&Principal, FabricError> {
        ctx.connection
            .principal
            .as_ref()
            .ok_or_else(|| FabricError::Auth("unauthenticated".into()))
    }

    fn payload_str<'a>(ctx: &'a EventContext, key: &str) -> Result<&'a str, FabricError> {
        ctx.payload
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| FabricError::Protocol(format!("missing field '{key}'")))
    }

    async fn handle_room_join(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let room_name = Self::payload_str(ctx, "roomName")?;
        let principal = Self::principal(ctx)?.clone();
        let room = self.get_or_create_room(room_name, false).await?;
        let newly_joined = room.join(&ctx.connection).await?;

        let members = self
            .services
            .state
            .count_clients_in_room(&self.name, room_name)
            .await
            .unwrap_or(0);
        let reply = Envelope::new(
            &self.name,
            "room:joined",
            serde_json::json!({ "roomName": room_name, "members": members }),
        )
        .with_room(room_name);
        let _ = ctx.connection.send(&reply);

        if newly_joined {
            let joined = Envelope::new(
                &self.name,
                "room:user_joined",
                serde_json::json!({ "user": { "id": principal.user_id, "name": principal.display_name } }),
            )
            .with_room(room_name);
            room.emit(joined, HashSet::from([ctx.connection.id])).await;
        }
        Ok(())
    }

    async fn handle_room_leave(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let room_name = Self::payload_str(ctx, "roomName")?;
        let principal = Self::principal(ctx)?.clone();
        let room = self
            .room(room_name)
            .await
            .ok_or_else(|| FabricError::Protocol(format!("unknown room: '{room_name}'")))?;

        let vacancy = room.leave(&ctx.connection).await?;

        let reply = Envelope::new(
            &self.name,
            "room:left",
            serde_json::json!({ "roomName": room_name }),
        )
        .with_room(room_name);
        let _ = ctx.connection.send(&reply);

        if vacancy == RoomVacancy::ClusterEmpty && !room.persistent {
            self.remove_room(room_name).await;
        } else {
            let left = Envelope::new(
                &self.name,
                "room:user_left",
                serde_json::json!({ "user": { "id": principal.user_id, "name": principal.display_name } }),
            )
            .with_room(room_name);
            room.emit(left, HashSet::from([ctx.connection.id])).await;
        }
        Ok(())
    }

    async fn handle_send_message(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let room_name = Self::payload_str(ctx, "roomName")?;
        let text = Self::payload_str(ctx, "text")?;
        let principal = Self::principal(ctx)?.clone();
        if !ctx.connection.is_in_room(room_name) {
            return Err(FabricError::Auth(format!("not a member of '{room_name}'")));
        }
        let room = self
            .room(room_name)
            .await
            .ok_or_else(|| FabricError::Protocol(format!("unknown room: '{room_name}'")))?;

        let envelope = Envelope::new(
            &self.name,
            "chat:message_new",
            serde_json::json!({ "text": text }),
        )
        .with_room(room_name)
        .with_sender(&principal);
        room.emit(envelope, HashSet::from([ctx.connection.id])).await;
        Ok(())
    }

    async fn handle_typing_start(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let room_name = Self::payload_str(ctx, "roomName")?;
        let principal = Self::principal(ctx)?.clone();
        if !ctx.connection.is_in_room(room_name) {
            return Err(FabricError::Auth(format!("not a member of '{room_name}'")));
        }
        let room = self
            .room(room_name)
            .await
            .ok_or_else(|| FabricError::Protocol(format!("unknown room: '{room_name}'")))?;

        let envelope = Envelope::new(
            &self.name,
            "chat:typing",
            serde_json::json!({ "user": { "id": principal.user_id, "name": principal.display_name } }),
        )
        .with_room(room_name)
        .with_sender(&principal);
        room.emit(envelope, HashSet::from([ctx.connection.id])).await;
        Ok(())
    }

    async fn handle_send_global(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let principal = Self::principal(ctx)?.clone();
        if !principal.access_level.is_admin() {
            return Err(FabricError::Auth("admin access required".into()));
        }
        let text = Self::payload_str(ctx, "text")?;

        let envelope = Envelope::new(
            &self.name,
            "chat:global_new",
            serde_json::json!({ "text": text }),
        )
        .with_sender(&principal);
        self.broadcast(envelope).await;
        Ok(())
    }

    async fn handle_ping(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let reply = Envelope::new(&self.name, "pong", ctx.payload.clone());
        let _ = ctx.connection.send(&reply);
        Ok(())
    }

    async fn handle_who_am_i(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let principal = Self::principal(ctx)?;
        let reply = Envelope::new(
            &self.name,
            "sys:who_am_i",
            serde_json::to_value(principal).unwrap_or(serde_json::Value::Null),
        );
        let _ = ctx.connection.send(&reply);
        Ok(())
    }

    async fn handle_list_rooms(self: &Arc<Self>, ctx: &EventContext) -> Result<(), FabricError> {
        let rooms = self.services.state.get_rooms(&self.name).await?;
        let reply = Envelope::new(
            &self.name,
            "room:list",
            serde_json::json!({ "rooms": rooms }),
        );
        let _ = ctx.connection.send(&reply);
        Ok(())
    }

    pub async fn send_error(&self, connection: &Arc<Connection>, err: &FabricError) {
        tracing::debug!(
            namespace = %self.name,
            connection_id = %connection.id,
            user_id = connection.user_id().unwrap_or("-"),
            err = %err,
            "Protocol reply: sys:error"
        );
        let envelope = Envelope::new(
            &self.name,
            "sys:error",
            serde_json::json!({ "code": err.wire_code(), "message": err.to_string() }),
        );
        let _ = connection.send(&envelope);
    }

    /// Pre-declare a persistent room with its periodic tasks at startup.
    pub async fn declare_persistent_room(
        self: &Arc<Self>,
        name: &str,
        tasks: Vec<RoomTask>,
    ) -> Result<Arc<Room>, FabricError> {
        let room = self.get_or_create_room(name, true).await?;
        for task in tasks {
            room.schedule_task(task).await?;
        }
        Ok(room)
    }

    /// Shutdown path: destroy every room (stopping tasks, dropping broker
    /// subscriptions) and release the namespace-level subscriptions.
    pub async fn destroy(self: &Arc<Self>) {
        let rooms: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        for name in rooms {
            let room = self.rooms.write().await.remove(&name);
            if let Some(room) = room {
                room.destroy().await;
            }
        }

        if let Some(token) = self.global_sub.lock().await.take() {
            let _ = self.services.broker.unsubscribe(token).await;
        }
        let user_tokens: Vec<SubscriptionToken> = {
            let mut subs = self.user_subs.lock().await;
            subs.drain().map(|(_, token)| token).collect()
        };
        for token in user_tokens {
            let _ = self.services.broker.unsubscribe(token).await;
        }
        tracing::info!(namespace = %self.name, "Namespace destroyed");
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
