//! Connection lifecycle
//!
//! One `Connection` owns exactly one WebSocket. All writes go through a
//! bounded single-writer queue, so delivery order on a connection equals the
//! order of `send` calls, and nothing else ever touches the socket's write
//! half. The read half is driven by the upgrade handler; this type only
//! keeps the bookkeeping the fabric needs: lifecycle state, heartbeat
//! liveness, the sliding rate window, and the joined-room set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::envelope::{Envelope, InstanceId, Principal};
use crate::error::FabricError;

/// Outbound writes queued per connection. A full queue marks a slow
/// consumer; frames are dropped rather than blocking the fabric.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// The connection arena. The namespace owns it; rooms resolve member ids
/// against it at flush time, so back-references stay id-only.
pub type ConnectionRegistry = Arc<tokio::sync::RwLock<HashMap<Uuid, Arc<Connection>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What the writer task pulls off the queue.
#[derive(Debug, PartialEq)]
pub enum Outbound {
    Frame(String),
    Ping(Vec<u8>),
    Close { code: u16, reason: String },
    Terminate,
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

pub struct Connection {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub principal: Option<Principal>,
    pub created_at: DateTime<Utc>,
    outbound: mpsc::Sender<Outbound>,
    state: Mutex<ConnectionState>,
    alive: AtomicBool,
    pong_deadline: Mutex<Option<Instant>>,
    rate: Mutex<RateWindow>,
    joined_rooms: Mutex<HashSet<String>>,
    last_action_ms: AtomicI64,
}

impl Connection {
    /// Create a connection and hand back the receiving end of its writer
    /// queue. The caller (the upgrade handler, or a test) pumps that
    /// receiver into the socket.
    pub fn new(
        instance_id: InstanceId,
        principal: Option<Principal>,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            instance_id,
            principal,
            created_at: Utc::now(),
            outbound,
            state: Mutex::new(ConnectionState::Connecting),
            alive: AtomicBool::new(true),
            pong_deadline: Mutex::new(None),
            rate: Mutex::new(RateWindow {
                window_start: Instant::now(),
                count: 0,
            }),
            joined_rooms: Mutex::new(HashSet::new()),
            last_action_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        (connection, rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Registration finished; frames may now be dispatched.
    pub fn mark_open(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Open;
        }
    }

    fn is_writable(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Open
        )
    }

    pub fn user_id(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.user_id.as_str())
    }

    /// Queue one envelope. Fails on a closed connection or a full queue;
    /// the frame is dropped either way.
    pub fn send(&self, envelope: &Envelope) -> Result<(), FabricError> {
        let wire = envelope.to_wire()?;
        self.send_raw(Outbound::Frame(wire))
    }

    /// Queue several envelopes as one `chat:batch` frame.
    pub fn send_batch(&self, items: &[Envelope]) -> Result<(), FabricError> {
        let frame = serde_json::json!({ "event": "chat:batch", "items": items });
        self.send_raw(Outbound::Frame(frame.to_string()))
    }

    pub fn send_ping(&self) -> Result<(), FabricError> {
        self.send_raw(Outbound::Ping(Vec::new()))
    }

    fn send_raw(&self, outbound: Outbound) -> Result<(), FabricError> {
        if !self.is_writable() {
            return Err(FabricError::Transport("connection not writable".into()));
        }
        self.outbound.try_send(outbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                FabricError::Transport("outbound queue full, frame dropped".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                FabricError::Transport("outbound queue closed".into())
            }
        })
    }

    /// Begin a close handshake. Idempotent; later calls and calls after
    /// `terminate` are no-ops.
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return,
                _ => *state = ConnectionState::Closing,
            }
        }
        let queued = self.outbound.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        if queued.is_err() {
            // Writer unreachable; fall back to an immediate drop.
            self.terminate();
        }
    }

    /// Immediate close without a handshake. Used by heartbeat and rate-limit
    /// enforcement. Idempotent.
    pub fn terminate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        let _ = self.outbound.try_send(Outbound::Terminate);
    }

    /// Writer task finished; the socket is gone.
    pub fn mark_closed(&self) {
        *self.state.lock().unwrap() = ConnectionState::Closed;
    }

    // ── Heartbeat bookkeeping ──────────────────────────────────────────

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// A PING went out: presume dead until the PONG lands.
    pub fn arm_pong_deadline(&self, timeout: Duration) {
        self.alive.store(false, Ordering::Relaxed);
        *self.pong_deadline.lock().unwrap() = Some(Instant::now() + timeout);
    }

    pub fn mark_pong(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.pong_deadline.lock().unwrap() = None;
    }

    pub fn pong_deadline_expired(&self) -> bool {
        self.pong_deadline
            .lock()
            .unwrap()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    // ── Rate limiting ──────────────────────────────────────────────────

    /// Count one inbound frame against the sliding 1 s window. Returns true
    /// when the limit is breached.
    pub fn register_inbound(&self, max_per_second: u32) -> bool {
        let mut rate = self.rate.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(rate.window_start) >= Duration::from_secs(1) {
            rate.window_start = now;
            rate.count = 0;
        }
        rate.count += 1;
        rate.count > max_per_second
    }

    // ── Activity & room bookkeeping ────────────────────────────────────

    pub fn touch_last_action(&self) {
        self.last_action_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_action_ms(&self) -> i64 {
        self.last_action_ms.load(Ordering::Relaxed)
    }

    pub fn note_room_joined(&self, room: &str) {
        self.joined_rooms.lock().unwrap().insert(room.to_string());
    }

    pub fn note_room_left(&self, room: &str) {
        self.joined_rooms.lock().unwrap().remove(room);
    }

    pub fn is_in_room(&self, room: &str) -> bool {
        self.joined_rooms.lock().unwrap().contains(room)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.joined_rooms.lock().unwrap().iter().cloned().collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("user_id", &self.user_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::AccessLevel;

    fn principal(user: &str) -> Principal {
        Principal {
            user_id: user.to_string(),
            display_name: user.to_string(),
            access_level: AccessLevel::User,
        }
    }

    fn connection() -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        Connection::new(InstanceId::new("test"), Some(principal("u1")))
    }

    #[tokio::test]
    async fn send_preserves_order() {
        let (conn, mut rx) = connection();
        for n in 0..3 {
            let envelope = Envelope::new("ns", format!("e{n}"), serde_json::Value::Null);
            conn.send(&envelope).unwrap();
        }
        for n in 0..3 {
            match rx.recv().await.unwrap() {
                Outbound::Frame(wire) => assert!(wire.contains(&format!("\"e{n}\""))),
                other => panic!("unexpected outbound: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_sends() {
        let (conn, mut rx) = connection();
        conn.close(1000, "bye");
        conn.close(1000, "bye again");
        conn.terminate();

        // Only the first close reached the queue.
        assert!(matches!(
            rx.recv().await.unwrap(),
            Outbound::Close { code: 1000, .. }
        ));
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Terminate));
        assert!(rx.try_recv().is_err());

        let envelope = Envelope::new("ns", "e", serde_json::Value::Null);
        assert!(conn.send(&envelope).is_err());
    }

    #[tokio::test]
    async fn rate_window_breaches_above_limit() {
        let (conn, _rx) = connection();
        for _ in 0..50 {
            assert!(!conn.register_inbound(50));
        }
        assert!(conn.register_inbound(50));
    }

    #[tokio::test]
    async fn rate_window_resets_after_one_second() {
        tokio::time::pause();
        let (conn, _rx) = connection();
        for _ in 0..50 {
            conn.register_inbound(50);
        }
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(!conn.register_inbound(50));
    }

    #[tokio::test]
    async fn pong_bookkeeping() {
        let (conn, _rx) = connection();
        assert!(conn.is_alive());

        conn.arm_pong_deadline(Duration::from_millis(5));
        assert!(!conn.is_alive());

        conn.mark_pong();
        assert!(conn.is_alive());
        assert!(!conn.pong_deadline_expired());

        conn.arm_pong_deadline(Duration::from_millis(0));
        assert!(conn.pong_deadline_expired());
    }

    #[tokio::test]
    async fn batch_frame_shape() {
        let (conn, mut rx) = connection();
        let items = vec![
            Envelope::new("ns", "chat:message_new", serde_json::json!({"text": "a"})),
            Envelope::new("ns", "chat:message_new", serde_json::json!({"text": "b"})),
        ];
        conn.send_batch(&items).unwrap();

        match rx.recv().await.unwrap() {
            Outbound::Frame(wire) => {
                let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
                assert_eq!(value["event"], "chat:batch");
                assert_eq!(value["items"].as_array().unwrap().len(), 2);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }
}
