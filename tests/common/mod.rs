//! Test utilities and helpers
//!
//! Everything runs on the in-memory backends. A `TestCluster` shares one
//! state store, one broker, and one lease table between several server
//! instances, which exercises the full cross-instance path (publish,
//! receipt, echo suppression, leases) inside one process.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use roomcast::auth::BearerAuthAdapter;
use roomcast::broker::{Broker, MemoryBroker};
use roomcast::config::{Backend, Config};
use roomcast::connection::{Connection, Outbound};
use roomcast::envelope::{AccessLevel, InboundFrame, InstanceId, Principal};
use roomcast::namespace::Namespace;
use roomcast::scheduler::{LeasedScheduler, LocalLeaseTable};
use roomcast::server::WsServer;
use roomcast::services::Services;
use roomcast::state::{MemoryStateStore, StateStore};

pub const TEST_JWT_SECRET: &str = "test-jwt-secret-minimum-32-characters";

/// Fast timings so scenarios resolve in tens of milliseconds.
pub fn test_config() -> Config {
    Config {
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
        room_idle_ttl: Duration::from_millis(100),
        presence_interval: Duration::from_millis(0),
        state_backend: Backend::Memory,
        broker_backend: Backend::Memory,
        scheduler_backend: Backend::Memory,
        redis_url: String::new(),
        broker_op_timeout: Duration::from_secs(5),
        publish_max_retries: 2,
        instance_id: None,
        jwt_secret: TEST_JWT_SECRET.into(),
        cors_origins: vec![],
    }
}

/// Shared backends for a simulated cluster.
pub struct TestCluster {
    pub state: Arc<dyn StateStore>,
    pub broker: Arc<dyn Broker>,
    pub leases: Arc<LocalLeaseTable>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryStateStore::new()),
            broker: Arc::new(MemoryBroker::new()),
            leases: Arc::new(LocalLeaseTable::new()),
        }
    }

    /// Spin up one instance against the shared backends.
    pub fn instance(&self, name: &str) -> Arc<WsServer> {
        self.instance_with_config(name, test_config())
    }

    pub fn instance_with_config(&self, name: &str, config: Config) -> Arc<WsServer> {
        let services = Services::with_backends(
            Arc::new(config),
            InstanceId::new(name),
            self.state.clone(),
            self.broker.clone(),
            Arc::new(LeasedScheduler::new(self.leases.clone())),
        );
        let auth = Arc::new(BearerAuthAdapter::new(TEST_JWT_SECRET));
        WsServer::new(services, auth)
    }
}

pub fn principal(user: &str, access_level: AccessLevel) -> Principal {
    Principal {
        user_id: user.to_string(),
        display_name: format!("{user} name"),
        access_level,
    }
}

/// Create and register a connection on a namespace, as the upgrade path
/// would after authentication.
pub async fn connect(
    server: &Arc<WsServer>,
    namespace: &Arc<Namespace>,
    user: &str,
    access_level: AccessLevel,
) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
    let (connection, rx) = Connection::new(
        server.instance_id().clone(),
        Some(principal(user, access_level)),
    );
    namespace
        .add_connection(&connection)
        .await
        .expect("connection registration");
    connection.mark_open();
    (connection, rx)
}

/// Dispatch one inbound event as the read loop would.
pub async fn dispatch(
    namespace: &Arc<Namespace>,
    connection: &Arc<Connection>,
    event: &str,
    payload: serde_json::Value,
) {
    namespace
        .handle_event(
            connection,
            InboundFrame {
                event: event.to_string(),
                payload,
            },
        )
        .await;
}

/// Drain every queued text frame into parsed JSON values.
pub fn drain_frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(outbound) = rx.try_recv() {
        if let Outbound::Frame(text) = outbound {
            frames.push(serde_json::from_str(&text).expect("frame is JSON"));
        }
    }
    frames
}

/// Drain frames, expanding `chat:batch` frames into their items.
pub fn drain_envelopes(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
    let mut envelopes = Vec::new();
    for frame in drain_frames(rx) {
        if frame["event"] == "chat:batch" {
            for item in frame["items"].as_array().cloned().unwrap_or_default() {
                envelopes.push(item);
            }
        } else {
            envelopes.push(frame);
        }
    }
    envelopes
}

/// Count delivered envelopes of one event type, batches included.
pub fn count_event(envelopes: &[serde_json::Value], event: &str) -> usize {
    envelopes.iter().filter(|e| e["event"] == event).count()
}

/// The first queued close, if any.
pub fn drain_close(rx: &mut mpsc::Receiver<Outbound>) -> Option<(u16, String)> {
    while let Ok(outbound) = rx.try_recv() {
        if let Outbound::Close { code, reason } = outbound {
            return Some((code, reason));
        }
    }
    None
}

/// Let batch timers and broker hops settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
