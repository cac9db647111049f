//! Monitoring and observability

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;

/// Fabric counters
#[derive(Clone)]
pub struct Metrics {
    pub connections_opened: Arc<AtomicU64>,
    pub connections_closed: Arc<AtomicU64>,
    pub envelopes_in: Arc<AtomicU64>,
    pub envelopes_out: Arc<AtomicU64>,
    pub batches_flushed: Arc<AtomicU64>,
    pub publishes_dropped: Arc<AtomicU64>,
    pub rate_limit_terminations: Arc<AtomicU64>,
    pub heartbeat_terminations: Arc<AtomicU64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            connections_opened: Arc::new(AtomicU64::new(0)),
            connections_closed: Arc::new(AtomicU64::new(0)),
            envelopes_in: Arc::new(AtomicU64::new(0)),
            envelopes_out: Arc::new(AtomicU64::new(0)),
            batches_flushed: Arc::new(AtomicU64::new(0)),
            publishes_dropped: Arc::new(AtomicU64::new(0)),
            rate_limit_terminations: Arc::new(AtomicU64::new(0)),
            heartbeat_terminations: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Metrics {
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_envelope_in(&self) {
        self.envelopes_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_envelope_out(&self) {
        self.envelopes_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_dropped(&self) {
        self.publishes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_termination(&self) {
        self.rate_limit_terminations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_termination(&self) {
        self.heartbeat_terminations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            envelopes_in: self.envelopes_in.load(Ordering::Relaxed),
            envelopes_out: self.envelopes_out.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            publishes_dropped: self.publishes_dropped.load(Ordering::Relaxed),
            rate_limit_terminations: self.rate_limit_terminations.load(Ordering::Relaxed),
            heartbeat_terminations: self.heartbeat_terminations.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot for serialization
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub envelopes_in: u64,
    pub envelopes_out: u64,
    pub batches_flushed: u64,
    pub publishes_dropped: u64,
    pub rate_limit_terminations: u64,
    pub heartbeat_terminations: u64,
}

/// Prometheus-compatible metrics endpoint
/// GET /monitoring/metrics
async fn metrics_endpoint(State(metrics): State<Metrics>) -> String {
    let s = metrics.snapshot();

    format!(
        r#"# HELP connections_opened Total WebSocket connections accepted
# TYPE connections_opened counter
connections_opened {}

# HELP connections_closed Total WebSocket connections closed
# TYPE connections_closed counter
connections_closed {}

# HELP envelopes_in Total inbound frames accepted
# TYPE envelopes_in counter
envelopes_in {}

# HELP envelopes_out Total envelopes written to sockets
# TYPE envelopes_out counter
envelopes_out {}

# HELP batches_flushed Total batch timer flushes
# TYPE batches_flushed counter
batches_flushed {}

# HELP publishes_dropped Envelopes dropped after exhausting publish retries
# TYPE publishes_dropped counter
publishes_dropped {}

# HELP rate_limit_terminations Connections closed for exceeding the rate limit
# TYPE rate_limit_terminations counter
rate_limit_terminations {}

# HELP heartbeat_terminations Connections terminated by the heartbeat sweep
# TYPE heartbeat_terminations counter
heartbeat_terminations {}
"#,
        s.connections_opened,
        s.connections_closed,
        s.envelopes_in,
        s.envelopes_out,
        s.batches_flushed,
        s.publishes_dropped,
        s.rate_limit_terminations,
        s.heartbeat_terminations,
    )
}

/// JSON snapshot
/// GET /monitoring/stats
async fn stats_endpoint(State(metrics): State<Metrics>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

pub fn router() -> Router<Metrics> {
    Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
}
