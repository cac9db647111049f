//! Room - the fan-out unit
//! ═══════════════════════════════════════════════════════════════════════════════════
//!
//! A room is the set of connections inside one namespace that receive the
//! same fan-out. Emitting into a room takes two orthogonal paths, in this
//! order:
//!
//! 1. a broker publish to `broker:<ns>:room:<room>`, stamped with the local
//!    instance as origin;
//! 2. a local enqueue into the batch queue, together with the skip set.
//!
//! Frames arriving from the broker join the same batch queue (after echo
//! suppression), so local and remote origins get identical batching. Every
//! room has exactly one batch timer: the first enqueue arms it, the flush
//! disarms it, and per-recipient subsets of two or more envelopes leave as a
//! single `chat:batch` frame.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::broker::{topics, SubscriptionToken};
use crate::connection::{Connection, ConnectionRegistry};
use crate::envelope::{BrokerFrame, Envelope};
use crate::error::FabricError;
use crate::scheduler::{TaskHandler, TaskSpec};
use crate::services::Services;

/// A periodic task owned by a room. The id is local to the room; the
/// scheduler sees it prefixed with the room's full name.
#[derive(Clone)]
pub struct RoomTask {
    pub id: String,
    pub interval: Duration,
    pub run_on_activation: bool,
    pub allow_overlap: bool,
    pub leader_only: bool,
    pub lock_duration: Option<Duration>,
    pub handler: TaskHandler,
}

/// What a leave transition left behind. The namespace reacts to
/// `ClusterEmpty` by removing non-persistent rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomVacancy {
    /// Local members remain.
    Occupied,
    /// No local members, but members exist on other instances.
    LocalEmpty,
    /// No members anywhere in the cluster.
    ClusterEmpty,
}

struct QueuedEnvelope {
    envelope: Envelope,
    except: HashSet<Uuid>,
}

struct BatchState {
    queue: Vec<QueuedEnvelope>,
    timer_armed: bool,
}

pub struct Room {
    pub name: String,
    pub namespace_name: String,
    pub persistent: bool,
    pub created_at: chrono::DateTime<Utc>,
    last_activity_ms: AtomicI64,
    services: Arc<Services>,
    registry: ConnectionRegistry,
    members: RwLock<HashSet<Uuid>>,
    batch: Mutex<BatchState>,
    tasks: Mutex<HashMap<String, RoomTask>>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

impl Room {
    pub fn new(
        name: impl Into<String>,
        namespace_name: impl Into<String>,
        persistent: bool,
        services: Arc<Services>,
        registry: ConnectionRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            namespace_name: namespace_name.into(),
            persistent,
            created_at: Utc::now(),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            services,
            registry,
            members: RwLock::new(HashSet::new()),
            batch: Mutex::new(BatchState {
                queue: Vec::new(),
                timer_armed: false,
            }),
            tasks: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
        })
    }

    fn topic(&self) -> String {
        topics::room(&self.namespace_name, &self.name)
    }

    /// Globally unique scheduler id for one of this room's tasks.
    pub fn task_full_id(&self, task_id: &str) -> String {
        format!(
            "namespace:{}:room:{}:task:{}",
            self.namespace_name, self.name, task_id
        )
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub async fn local_member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn local_members(&self) -> Vec<Uuid> {
        self.members.read().await.iter().copied().collect()
    }

    pub async fn is_subscribed(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    // ═══════════════════════════════════════════════════════════════════
    // MEMBERSHIP
    // ═══════════════════════════════════════════════════════════════════

    /// Idempotent join; returns whether membership actually changed. The
    /// first local member subscribes the room to its broker topic and
    /// switches its tasks on. A membership write that fails after retries is
    /// returned to the caller, which terminates the connection to keep store
    /// and local maps consistent.
    pub async fn join(self: &Arc<Self>, connection: &Arc<Connection>) -> Result<bool, FabricError> {
        if self.members.read().await.contains(&connection.id) {
            return Ok(false);
        }

        let state = self.services.state.clone();
        let (ns, room, id) = (self.namespace_name.clone(), self.name.clone(), connection.id);
        self.services
            .state_write(|| {
                let state = state.clone();
                let ns = ns.clone();
                let room = room.clone();
                async move { state.add_user_to_room(&ns, &room, id).await }
            })
            .await?;

        let became_first = {
            let mut members = self.members.write().await;
            let inserted = members.insert(connection.id);
            inserted && members.len() == 1
        };
        connection.note_room_joined(&self.name);
        self.touch();

        tracing::info!(
            namespace = %self.namespace_name,
            room = %self.name,
            connection_id = %connection.id,
            user_id = connection.user_id().unwrap_or("-"),
            "Connection joined room"
        );

        if became_first {
            self.subscribe().await;
            self.tasks_on().await;
        }
        Ok(true)
    }

    /// Idempotent leave. The last local member unsubscribes the room and
    /// switches its tasks off; the returned vacancy tells the namespace
    /// whether the room drained cluster-wide.
    pub async fn leave(self: &Arc<Self>, connection: &Arc<Connection>) -> Result<RoomVacancy, FabricError> {
        let (removed, now_empty) = {
            let mut members = self.members.write().await;
            let removed = members.remove(&connection.id);
            (removed, members.is_empty())
        };
        connection.note_room_left(&self.name);

        if removed {
            let state = self.services.state.clone();
            let (ns, room, id) = (self.namespace_name.clone(), self.name.clone(), connection.id);
            if let Err(e) = self
                .services
                .state_write(|| {
                    let state = state.clone();
                    let ns = ns.clone();
                    let room = room.clone();
                    async move { state.remove_user_from_room(&ns, &room, id).await }
                })
                .await
            {
                tracing::error!(
                    namespace = %self.namespace_name,
                    room = %self.name,
                    connection_id = %connection.id,
                    err = %e,
                    "Membership removal failed after retries"
                );
            }
            self.touch();
            tracing::info!(
                namespace = %self.namespace_name,
                room = %self.name,
                connection_id = %connection.id,
                "Connection left room"
            );
        }

        if !now_empty {
            return Ok(RoomVacancy::Occupied);
        }

        self.unsubscribe().await;
        self.tasks_off().await;

        let cluster_count = self
            .services
            .state
            .count_clients_in_room(&self.namespace_name, &self.name)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(room = %self.name, err = %e, "Cluster member count failed");
                1 // assume occupied; the idle sweep will retry
            });
        if cluster_count == 0 {
            Ok(RoomVacancy::ClusterEmpty)
        } else {
            Ok(RoomVacancy::LocalEmpty)
        }
    }

    async fn subscribe(self: &Arc<Self>) {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return;
        }
        let weak: Weak<Room> = Arc::downgrade(self);
        let handler: crate::broker::BrokerHandler = Arc::new(move |payload: Bytes| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(room) = weak.upgrade() {
                    room.handle_broker_frame(payload).await;
                }
            })
        });
        match self.services.broker.subscribe(&self.topic(), handler).await {
            Ok(token) => {
                tracing::debug!(topic = %self.topic(), "Room subscribed");
                *subscription = Some(token);
            }
            Err(e) => {
                tracing::error!(topic = %self.topic(), err = %e, "Room subscribe failed");
            }
        }
    }

    async fn unsubscribe(&self) {
        let token = self.subscription.lock().await.take();
        if let Some(token) = token {
            if let Err(e) = self.services.broker.unsubscribe(token).await {
                tracing::warn!(topic = %self.topic(), err = %e, "Room unsubscribe failed");
            } else {
                tracing::debug!(topic = %self.topic(), "Room unsubscribed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // FAN-OUT
    // ═══════════════════════════════════════════════════════════════════

    /// Fan an envelope out to the room: broker first (so peers start
    /// delivering), then the local batch queue.
    pub async fn emit(self: &Arc<Self>, envelope: Envelope, except: HashSet<Uuid>) {
        self.touch();
        let frame = BrokerFrame::new(self.services.instance_id.clone(), envelope.clone())
            .with_except(except.clone());
        self.services.publish_frame(&self.topic(), &frame).await;
        self.enqueue(envelope, except).await;
    }

    /// Broker receipt path: suppress echoes, then batch exactly like a
    /// local emit.
    pub async fn handle_broker_frame(self: &Arc<Self>, payload: Bytes) {
        let frame = match BrokerFrame::decode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(room = %self.name, err = %e, "Undecodable broker frame dropped");
                return;
            }
        };
        if frame.origin == self.services.instance_id {
            return;
        }
        self.enqueue(frame.envelope, frame.except).await;
    }

    /// Queue an envelope for the next flush, arming the single batch timer
    /// if it is not already running.
    async fn enqueue(self: &Arc<Self>, envelope: Envelope, except: HashSet<Uuid>) {
        let arm = {
            let mut batch = self.batch.lock().await;
            batch.queue.push(QueuedEnvelope { envelope, except });
            if batch.timer_armed {
                false
            } else {
                batch.timer_armed = true;
                true
            }
        };
        if arm {
            let room = self.clone();
            let interval = self.services.config.batch_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                room.flush().await;
            });
        }
    }

    /// Drain the queue and deliver. Each local member gets the subset of
    /// queued envelopes whose skip set does not name it; subsets of two or
    /// more leave as one `chat:batch` frame, smaller ones as plain frames.
    /// Enqueue order is preserved either way.
    pub async fn flush(self: &Arc<Self>) {
        let queue = {
            let mut batch = self.batch.lock().await;
            batch.timer_armed = false;
            std::mem::take(&mut batch.queue)
        };
        if queue.is_empty() {
            return;
        }
        self.services.metrics.record_batch_flushed();

        let member_ids = self.local_members().await;
        let connections: Vec<Arc<Connection>> = {
            let registry = self.registry.read().await;
            member_ids
                .iter()
                .filter_map(|id| registry.get(id).cloned())
                .collect()
        };

        for connection in connections {
            let items: Vec<Envelope> = queue
                .iter()
                .filter(|queued| !queued.except.contains(&connection.id))
                .map(|queued| queued.envelope.clone())
                .collect();
            let delivered = items.len();

            let result = if items.len() >= 2 {
                connection.send_batch(&items)
            } else if let Some(envelope) = items.first() {
                connection.send(envelope)
            } else {
                continue;
            };

            match result {
                Ok(()) => {
                    for _ in 0..delivered {
                        self.services.metrics.record_envelope_out();
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        room = %self.name,
                        connection_id = %connection.id,
                        err = %e,
                        "Flush delivery skipped"
                    );
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // TASKS
    // ═══════════════════════════════════════════════════════════════════

    /// Register a periodic task. Rejected when the id is already taken.
    /// Starts immediately when the room already has local members.
    pub async fn schedule_task(&self, task: RoomTask) -> Result<(), FabricError> {
        let active = {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&task.id) {
                return Err(FabricError::Conflict(format!(
                    "room '{}' already has task '{}'",
                    self.name, task.id
                )));
            }
            tasks.insert(task.id.clone(), task.clone());
            self.local_member_count().await > 0
        };
        if active {
            self.start_task(&task).await;
        }
        Ok(())
    }

    fn to_spec(&self, task: &RoomTask) -> TaskSpec {
        TaskSpec {
            task_id: self.task_full_id(&task.id),
            interval: task.interval,
            run_on_activation: task.run_on_activation,
            allow_overlap: task.allow_overlap,
            leader_only: task.leader_only,
            lock_duration: task.lock_duration,
            handler: task.handler.clone(),
        }
    }

    async fn start_task(&self, task: &RoomTask) {
        match self.services.scheduler.schedule(self.to_spec(task)).await {
            Ok(()) => {}
            Err(FabricError::Conflict(_)) => {} // already running
            Err(e) => {
                tracing::error!(
                    room = %self.name,
                    task_id = %task.id,
                    err = %e,
                    "Task activation failed"
                );
            }
        }
    }

    async fn tasks_on(&self) {
        let tasks: Vec<RoomTask> = self.tasks.lock().await.values().cloned().collect();
        for task in tasks {
            self.start_task(&task).await;
        }
    }

    async fn tasks_off(&self) {
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.services.scheduler.stop(&self.task_full_id(&id)).await {
                tracing::warn!(room = %self.name, task_id = %id, err = %e, "Task stop failed");
            }
        }
    }

    /// Leader-only presence task: publishes the cluster-wide member count
    /// into the room as `room:stats` on the given interval.
    pub fn presence_task(self: &Arc<Self>, interval: Duration) -> RoomTask {
        let weak = Arc::downgrade(self);
        let handler: TaskHandler = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(room) = weak.upgrade() {
                    room.publish_presence().await;
                }
            })
        });
        RoomTask {
            id: "presence".into(),
            interval,
            run_on_activation: false,
            allow_overlap: false,
            leader_only: true,
            lock_duration: None,
            handler,
        }
    }

    async fn publish_presence(self: &Arc<Self>) {
        let members = self
            .services
            .state
            .count_clients_in_room(&self.namespace_name, &self.name)
            .await
            .unwrap_or(0);
        let envelope = Envelope::new(
            &self.namespace_name,
            "room:stats",
            serde_json::json!({ "roomName": self.name, "members": members }),
        )
        .with_room(&self.name);
        self.emit(envelope, HashSet::new()).await;
    }

    /// Local teardown at namespace destruction: stop tasks, drop the broker
    /// subscription, forget members. Store rows are handled by the caller.
    pub async fn destroy(self: &Arc<Self>) {
        self.tasks_off().await;
        self.unsubscribe().await;
        self.members.write().await.clear();
        let mut batch = self.batch.lock().await;
        batch.queue.clear();
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("namespace", &self.namespace_name)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::Config;
    use crate::connection::Outbound;
    use crate::envelope::{AccessLevel, InstanceId, Principal};
    use crate::scheduler::{LeasedScheduler, LocalLeaseTable};
    use crate::state::MemoryStateStore;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            base_path: "/ws".into(),
            environment: "test".into(),
            default_namespace: "default".into(),
            extra_namespaces: vec![],
            persistent_rooms: vec![],
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            check_delay_per_client: Duration::from_millis(1),
            max_msgs_per_second: 50,
            max_payload_bytes: 65536,
            batch_interval: Duration::from_millis(10),
            room_idle_ttl: Duration::from_millis(200),
            presence_interval: Duration::from_millis(0),
            state_backend: crate::config::Backend::Memory,
            broker_backend: crate::config::Backend::Memory,
            scheduler_backend: crate::config::Backend::Memory,
            redis_url: String::new(),
            broker_op_timeout: Duration::from_secs(5),
            publish_max_retries: 2,
            instance_id: None,
            jwt_secret: "test-secret".into(),
            cors_origins: vec![],
        })
    }

    fn services(instance: &str) -> Arc<Services> {
        Services::with_backends(
            test_config(),
            InstanceId::new(instance),
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryBroker::new()),
            Arc::new(LeasedScheduler::new(Arc::new(LocalLeaseTable::new()))),
        )
    }

    async fn register(registry: &ConnectionRegistry, conn: &Arc<Connection>) {
        registry.write().await.insert(conn.id, conn.clone());
    }

    fn new_connection(instance: &str, user: &str) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<Outbound>) {
        let principal = Principal {
            user_id: user.to_string(),
            display_name: user.to_string(),
            access_level: AccessLevel::User,
        };
        Connection::new(InstanceId::new(instance), Some(principal))
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let services = services("a");
        let registry: ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));
        let room = Room::new("general", "chat", false, services.clone(), registry.clone());
        let (conn, _rx) = new_connection("a", "u1");
        register(&registry, &conn).await;

        for _ in 0..3 {
            room.join(&conn).await.unwrap();
        }
        assert_eq!(room.local_member_count().await, 1);
        assert_eq!(
            services.state.count_clients_in_room("chat", "general").await.unwrap(),
            1
        );
        assert!(conn.is_in_room("general"));
        assert!(room.is_subscribed().await);
    }

    #[tokio::test]
    async fn last_leave_unsubscribes_and_reports_cluster_empty() {
        let services = services("a");
        let registry: ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));
        let room = Room::new("general", "chat", false, services.clone(), registry.clone());
        let (conn, _rx) = new_connection("a", "u1");
        register(&registry, &conn).await;

        room.join(&conn).await.unwrap();
        let vacancy = room.leave(&conn).await.unwrap();

        assert_eq!(vacancy, RoomVacancy::ClusterEmpty);
        assert!(!room.is_subscribed().await);
        assert!(!conn.is_in_room("general"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_coalesces_two_or_more() {
        let services = services("a");
        let registry: ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));
        let room = Room::new("general", "chat", false, services.clone(), registry.clone());
        let (conn, mut rx) = new_connection("a", "u1");
        register(&registry, &conn).await;
        room.join(&conn).await.unwrap();

        let e1 = Envelope::new("chat", "chat:message_new", serde_json::json!({"text": "a"}));
        let e2 = Envelope::new("chat", "chat:message_new", serde_json::json!({"text": "b"}));
        room.emit(e1, HashSet::new()).await;
        room.emit(e2, HashSet::new()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        match rx.try_recv().unwrap() {
            Outbound::Frame(wire) => {
                let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
                assert_eq!(value["event"], "chat:batch");
                assert_eq!(value["items"].as_array().unwrap().len(), 2);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "no second frame expected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn except_set_skips_the_sender() {
        let services = services("a");
        let registry: ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));
        let room = Room::new("general", "chat", false, services.clone(), registry.clone());
        let (sender, mut sender_rx) = new_connection("a", "u1");
        let (receiver, mut receiver_rx) = new_connection("a", "u2");
        register(&registry, &sender).await;
        register(&registry, &receiver).await;
        room.join(&sender).await.unwrap();
        room.join(&receiver).await.unwrap();

        let envelope = Envelope::new("chat", "chat:message_new", serde_json::json!({"text": "hi"}));
        let except: HashSet<Uuid> = [sender.id].into_iter().collect();
        room.emit(envelope, except).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sender_rx.try_recv().is_err(), "sender must not see its own message");
        assert!(matches!(receiver_rx.try_recv().unwrap(), Outbound::Frame(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broker_echo_is_suppressed() {
        let services = services("a");
        let registry: ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));
        let room = Room::new("general", "chat", false, services.clone(), registry.clone());
        let (conn, mut rx) = new_connection("a", "u1");
        register(&registry, &conn).await;
        room.join(&conn).await.unwrap();

        let envelope = Envelope::new("chat", "chat:message_new", serde_json::json!({"text": "hi"}));
        let own = BrokerFrame::new(InstanceId::new("a"), envelope.clone());
        room.handle_broker_frame(Bytes::from(own.encode().unwrap())).await;

        let remote = BrokerFrame::new(InstanceId::new("b"), envelope);
        room.handle_broker_frame(Bytes::from(remote.encode().unwrap())).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only the remote-origin copy was delivered.
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let services = services("a");
        let registry: ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));
        let room = Room::new("lobby", "chat", true, services, registry);
        let task = RoomTask {
            id: "stats".into(),
            interval: Duration::from_secs(60),
            run_on_activation: false,
            allow_overlap: false,
            leader_only: true,
            lock_duration: None,
            handler: Arc::new(|| Box::pin(async {})),
        };
        room.schedule_task(task.clone()).await.unwrap();
        assert!(room.schedule_task(task).await.is_err());
    }
}
