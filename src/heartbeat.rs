//! Heartbeat sweep
//!
//! Per connection the state machine is:
//! `alive=true → (sweep) pinged, alive=false, deadline armed →
//! (pong) alive=true, deadline cleared | (deadline elapsed) terminate`.
//!
//! The sweep is spread: connections are pinged at fixed small increments so
//! the ping budget never bursts. A connection that shows no pong by the next
//! sweep is terminated and removed, which bounds detection at
//! `ping_interval + pong_timeout`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::server::WsServer;

pub fn spawn(server: Arc<WsServer>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(run(server, shutdown))
}

async fn run(server: Arc<WsServer>, mut shutdown: watch::Receiver<bool>) {
    let config = server.config().clone();
    tracing::info!(
        ping_interval_ms = config.ping_interval.as_millis() as u64,
        pong_timeout_ms = config.pong_timeout.as_millis() as u64,
        "Heartbeat started"
    );
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(config.ping_interval) => {}
        }
        sweep(&server, &config).await;
    }
    tracing::debug!("Heartbeat stopped");
}

pub(crate) async fn sweep(server: &Arc<WsServer>, config: &Config) {
    let connections = server.all_connections().await;

    // Sweep duration must fit inside the ping interval, otherwise the
    // configuration cannot keep up with the connection count.
    let budget = config.check_delay_per_client * connections.len() as u32;
    if budget > config.ping_interval {
        tracing::warn!(
            connections = connections.len(),
            sweep_ms = budget.as_millis() as u64,
            ping_interval_ms = config.ping_interval.as_millis() as u64,
            "Heartbeat sweep exceeds ping interval; raise PING_INTERVAL_MS or lower CHECK_DELAY_PER_CLIENT_MS"
        );
    }

    for (namespace, connection) in connections {
        tokio::time::sleep(config.check_delay_per_client).await;

        if connection.state() == crate::connection::ConnectionState::Closed {
            continue;
        }

        if !connection.is_alive() || connection.pong_deadline_expired() {
            tracing::warn!(
                namespace = %namespace.name,
                connection_id = %connection.id,
                user_id = connection.user_id().unwrap_or("-"),
                "No pong before deadline, terminating"
            );
            server.services().metrics.record_heartbeat_termination();
            connection.terminate();
            namespace.remove_connection(&connection).await;
            continue;
        }

        connection.arm_pong_deadline(config.pong_timeout);
        if connection.send_ping().is_err() {
            tracing::debug!(
                namespace = %namespace.name,
                connection_id = %connection.id,
                "Ping enqueue failed"
            );
        }
    }
}
