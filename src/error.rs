//! Fabric error taxonomy
//!
//! Kinds, not types: every failure the fabric surfaces falls into one of the
//! variants below. Raw errors from tasks or handlers never reach a socket;
//! they are wrapped into a `sys:error` envelope carrying the coarse wire
//! code from [`FabricError::wire_code`].

use thiserror::Error;

/// WebSocket close codes used by the fabric.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Going away - graceful server shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation - unknown namespace or invalid frame at upgrade.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Internal error.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Authentication failed at upgrade time.
    pub const AUTH_FAILED: u16 = 4001;
    /// Per-connection rate limit exceeded.
    pub const RATE_LIMIT: u16 = 4003;
}

#[derive(Debug, Error)]
pub enum FabricError {
    /// Invalid frame, unknown event, payload too large, bad room name.
    /// Surfaced to the originator as `sys:error`; the connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unauthenticated send or insufficient role.
    #[error("authorization error: {0}")]
    Auth(String),

    /// Sliding-window rate limit breached. The connection is closed with 4003.
    #[error("rate limit exceeded")]
    RateLimit,

    /// Socket read/write failure. The normal termination signal, not an
    /// exceptional condition.
    #[error("transport error: {0}")]
    Transport(String),

    /// StateStore failure. Retryable with back-off.
    #[error("state store error: {0}")]
    State(String),

    /// Non-retryable state conflict (e.g. removing a non-empty namespace,
    /// scheduling a duplicate task id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Broker failure. Retryable; exhausted publishes drop the envelope.
    #[error("broker error: {0}")]
    Broker(String),

    /// Scheduler failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Startup misconfiguration. Exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl FabricError {
    /// Coarse code carried in the `sys:error` payload.
    pub fn wire_code(&self) -> &'static str {
        match self {
            FabricError::Protocol(_) => "PROTOCOL_ERROR",
            FabricError::Auth(_) => "UNAUTHORIZED",
            FabricError::RateLimit => "RATE_LIMITED",
            FabricError::Transport(_) => "TRANSPORT_ERROR",
            FabricError::State(_) | FabricError::Broker(_) | FabricError::Scheduler(_) => "SUBSYSTEM_ERROR",
            FabricError::Conflict(_) => "CONFLICT",
            FabricError::Fatal(_) => "FATAL",
        }
    }

    /// Whether the caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::State(_) | FabricError::Broker(_) | FabricError::Scheduler(_)
        )
    }
}
