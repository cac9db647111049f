//! Application configuration

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which implementation backs a pluggable subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Redis,
}

impl Backend {
    fn parse(raw: &str, var: &str) -> Result<Self> {
        match raw {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            other => bail!("{var} must be 'memory' or 'redis', got '{other}'"),
        }
    }
}

/// A room pre-declared at startup. Persistent rooms survive the last member
/// leaving and are never garbage collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredRoom {
    pub namespace: String,
    pub room: String,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    // Server
    pub listen_addr: SocketAddr,
    pub base_path: String,
    pub environment: String,
    pub default_namespace: String,
    pub extra_namespaces: Vec<String>,
    pub persistent_rooms: Vec<DeclaredRoom>,

    // Heartbeat
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub check_delay_per_client: Duration,

    // Per-connection limits
    pub max_msgs_per_second: u32,
    pub max_payload_bytes: usize,

    // Rooms
    pub batch_interval: Duration,
    pub room_idle_ttl: Duration,
    pub presence_interval: Duration,

    // Backends
    pub state_backend: Backend,
    pub broker_backend: Backend,
    pub scheduler_backend: Backend,
    pub redis_url: String,

    // Broker resilience
    pub broker_op_timeout: Duration,
    pub publish_max_retries: u32,

    // Identity
    pub instance_id: Option<String>,

    // Auth
    pub jwt_secret: String,

    // CORS
    pub cors_origins: Vec<String>,
}

fn env_ms(var: &str, default_ms: u64) -> Result<Duration> {
    let raw = std::env::var(var).unwrap_or_else(|_| default_ms.to_string());
    let ms: u64 = raw.parse().with_context(|| format!("Invalid {var}"))?;
    Ok(Duration::from_millis(ms))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let state_backend = Backend::parse(
            &std::env::var("STATE_BACKEND").unwrap_or_else(|_| "memory".to_string()),
            "STATE_BACKEND",
        )?;
        let broker_backend = Backend::parse(
            &std::env::var("BROKER_BACKEND").unwrap_or_else(|_| "memory".to_string()),
            "BROKER_BACKEND",
        )?;
        let scheduler_backend = Backend::parse(
            &std::env::var("SCHEDULER_BACKEND").unwrap_or_else(|_| "memory".to_string()),
            "SCHEDULER_BACKEND",
        )?;

        let redis_url = std::env::var("REDIS_URL").unwrap_or_default();
        if redis_url.is_empty()
            && [state_backend, broker_backend, scheduler_backend].contains(&Backend::Redis)
        {
            bail!("REDIS_URL required when any backend is 'redis'");
        }

        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
                .parse()
                .context("Invalid LISTEN_ADDR")?,
            base_path: normalize_base_path(
                &std::env::var("BASE_PATH").unwrap_or_else(|_| "/ws".to_string()),
            ),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            default_namespace: std::env::var("DEFAULT_NAMESPACE")
                .unwrap_or_else(|_| "default".to_string()),
            extra_namespaces: std::env::var("NAMESPACES")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            persistent_rooms: parse_declared_rooms(
                &std::env::var("PERSISTENT_ROOMS").unwrap_or_default(),
            )?,

            ping_interval: env_ms("PING_INTERVAL_MS", 30_000)?,
            pong_timeout: env_ms("PONG_TIMEOUT_MS", 10_000)?,
            check_delay_per_client: env_ms("CHECK_DELAY_PER_CLIENT_MS", 10)?,

            max_msgs_per_second: std::env::var("MAX_MSGS_PER_SECOND")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("Invalid MAX_MSGS_PER_SECOND")?,
            max_payload_bytes: std::env::var("MAX_PAYLOAD_BYTES")
                .unwrap_or_else(|_| "65536".to_string())
                .parse()
                .context("Invalid MAX_PAYLOAD_BYTES")?,

            batch_interval: env_ms("BATCH_INTERVAL_MS", 20)?,
            room_idle_ttl: env_ms("ROOM_IDLE_TTL_MS", 60_000)?,
            presence_interval: env_ms("PRESENCE_INTERVAL_MS", 0)?,

            state_backend,
            broker_backend,
            scheduler_backend,
            redis_url,

            broker_op_timeout: env_ms("BROKER_OP_TIMEOUT_MS", 5_000)?,
            publish_max_retries: std::env::var("PUBLISH_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("Invalid PUBLISH_MAX_RETRIES")?,

            instance_id: std::env::var("INSTANCE_ID").ok().filter(|s| !s.is_empty()),

            jwt_secret: std::env::var("JWT_SECRET").context("JWT_SECRET required")?,

            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Ensure the base path starts with `/` and carries no trailing slash.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Parse `PERSISTENT_ROOMS` entries of the form `ns/room[,ns/room...]`.
fn parse_declared_rooms(raw: &str) -> Result<Vec<DeclaredRoom>> {
    let mut rooms = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (namespace, room) = entry
            .split_once('/')
            .with_context(|| format!("Invalid PERSISTENT_ROOMS entry '{entry}', expected ns/room"))?;
        rooms.push(DeclaredRoom {
            namespace: namespace.trim().to_string(),
            room: room.trim().to_string(),
        });
    }
    Ok(rooms)
}
