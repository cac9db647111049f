//! WebSocket server
//! ═══════════════════════════════════════════════════════════════════════════════════
//!
//! Owns the namespace catalogue, the upgrade admission path, the global
//! broadcast topic, the heartbeat loop, and the shutdown sequence. The
//! server is a value built from injected services; nothing here reaches
//! into process globals.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::auth::AuthAdapter;
use crate::broker::{topics, BrokerHandler, SubscriptionToken};
use crate::config::Config;
use crate::connection::Connection;
use crate::envelope::{BrokerFrame, Envelope, InstanceId};
use crate::error::{close_code, FabricError};
use crate::heartbeat;
use crate::namespace::{valid_namespace_name, Namespace};
use crate::services::Services;

/// Reason string sent with the 1008 close on an unknown namespace.
pub const NS_NOT_FOUND: &str = "NS_NOT_FOUND";
/// Reason string sent with the 4001 close on a rejected principal.
pub const AUTH_FAILED: &str = "AUTH_FAILED";
/// Reason string sent with the 1001 close at shutdown.
pub const SERVER_SHUTDOWN: &str = "server_shutdown";

pub struct WsServer {
    services: Arc<Services>,
    auth: Arc<dyn AuthAdapter>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    global_sub: Mutex<Option<SubscriptionToken>>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl WsServer {
    pub fn new(services: Arc<Services>, auth: Arc<dyn AuthAdapter>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            services,
            auth,
            namespaces: RwLock::new(HashMap::new()),
            global_sub: Mutex::new(None),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.services.config
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.services.instance_id
    }

    pub fn auth(&self) -> &Arc<dyn AuthAdapter> {
        &self.auth
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Attach the cluster-wide broadcast subscription and start the
    /// heartbeat. Called once, after the namespaces are registered.
    pub async fn start(self: &Arc<Self>) -> Result<(), FabricError> {
        let weak = Arc::downgrade(self);
        let handler: BrokerHandler = Arc::new(move |payload: Bytes| {
            let weak: Weak<WsServer> = weak.clone();
            Box::pin(async move {
                if let Some(server) = weak.upgrade() {
                    server.handle_global_frame(payload).await;
                }
            })
        });
        let token = self.services.broker.subscribe(topics::GLOBAL, handler).await?;
        *self.global_sub.lock().await = Some(token);

        let handle = heartbeat::spawn(self.clone(), self.shutdown_signal());
        self.background.lock().await.push(handle);

        tracing::info!(instance_id = %self.services.instance_id, "Fabric server started");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // NAMESPACES
    // ═══════════════════════════════════════════════════════════════════

    /// Create and catalogue a namespace (idempotent), wiring its broker
    /// subscription and idle-room sweep. Namespaces are registered before
    /// the listener accepts upgrades, so lookups never race creation.
    pub async fn register_namespace(self: &Arc<Self>, name: &str) -> Result<Arc<Namespace>, FabricError> {
        if !valid_namespace_name(name) {
            return Err(FabricError::Fatal(format!("invalid namespace name: '{name}'")));
        }
        if let Some(existing) = self.namespaces.read().await.get(name) {
            return Ok(existing.clone());
        }

        let namespace = Namespace::new(name, self.services.clone());
        namespace.init().await?;

        let sweep = namespace.spawn_idle_sweep(self.shutdown_signal());
        self.background.lock().await.push(sweep);

        self.namespaces
            .write()
            .await
            .insert(name.to_string(), namespace.clone());
        tracing::info!(namespace = %name, "Namespace registered");
        Ok(namespace)
    }

    pub async fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().await.get(name).cloned()
    }

    pub async fn namespaces_snapshot(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.read().await.values().cloned().collect()
    }

    pub async fn all_connections(&self) -> Vec<(Arc<Namespace>, Arc<Connection>)> {
        let namespaces = self.namespaces_snapshot().await;
        let mut connections = Vec::new();
        for namespace in namespaces {
            for connection in namespace.connections_snapshot().await {
                connections.push((namespace.clone(), connection));
            }
        }
        connections
    }

    // ═══════════════════════════════════════════════════════════════════
    // GLOBAL FAN-OUT
    // ═══════════════════════════════════════════════════════════════════

    /// Deliver to every local connection in every namespace, then publish
    /// to `broker:wss:global` for the peers.
    pub async fn broadcast_all(&self, envelope: Envelope) {
        for namespace in self.namespaces_snapshot().await {
            namespace.broadcast_local(&envelope).await;
        }
        let frame = BrokerFrame::new(self.services.instance_id.clone(), envelope);
        self.services.publish_frame(topics::GLOBAL, &frame).await;
    }

    async fn handle_global_frame(&self, payload: Bytes) {
        let frame = match BrokerFrame::decode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(err = %e, "Undecodable global frame dropped");
                return;
            }
        };
        if frame.origin == self.services.instance_id {
            return;
        }
        for namespace in self.namespaces_snapshot().await {
            namespace.broadcast_local(&frame.envelope).await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // SHUTDOWN
    // ═══════════════════════════════════════════════════════════════════

    /// Graceful shutdown: stop the heartbeat and sweeps, destroy every
    /// namespace's rooms, close every local connection with 1001, purge
    /// this instance's store rows, then release the broker.
    pub async fn shutdown(self: &Arc<Self>) {
        tracing::info!(instance_id = %self.services.instance_id, "Fabric shutdown started");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.services.scheduler.shutdown().await;

        let namespaces = self.namespaces_snapshot().await;
        for namespace in &namespaces {
            namespace.destroy().await;
        }
        for namespace in &namespaces {
            for connection in namespace.connections_snapshot().await {
                connection.close(close_code::GOING_AWAY, SERVER_SHUTDOWN);
                self.services.metrics.record_connection_closed();
            }
        }

        if let Some(token) = self.global_sub.lock().await.take() {
            let _ = self.services.broker.unsubscribe(token).await;
        }

        if let Err(e) = self
            .services
            .state
            .clear_instance_data(&self.services.instance_id)
            .await
        {
            tracing::error!(err = %e, "Instance data purge failed at shutdown");
        }

        self.services.broker.close().await;
        tracing::info!(instance_id = %self.services.instance_id, "Fabric shutdown complete");
    }
}

/// Resolve the namespace name from an upgrade path: strip the base prefix,
/// take the first non-empty segment, fall back to the default. An invalid
/// segment is a policy violation (close 1008).
pub fn namespace_name_from_path(
    base_path: &str,
    default_namespace: &str,
    path: &str,
) -> Result<String, FabricError> {
    let remainder = if base_path.is_empty() {
        path
    } else {
        match path.strip_prefix(base_path) {
            Some(rest) => rest,
            None => path,
        }
    };

    let segment = remainder.split('/').find(|s| !s.is_empty());
    let name = match segment {
        Some(segment) => segment,
        None => default_namespace,
    };
    if !valid_namespace_name(name) {
        return Err(FabricError::Protocol(format!("invalid namespace: '{name}'")));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_resolution_strips_prefix_and_defaults() {
        assert_eq!(namespace_name_from_path("/ws", "default", "/ws/chat").unwrap(), "chat");
        assert_eq!(
            namespace_name_from_path("/ws", "default", "/ws/chat/anything/else").unwrap(),
            "chat"
        );
        assert_eq!(namespace_name_from_path("/ws", "default", "/ws").unwrap(), "default");
        assert_eq!(namespace_name_from_path("/ws", "default", "/ws/").unwrap(), "default");
        assert_eq!(namespace_name_from_path("", "default", "/chat").unwrap(), "chat");
    }

    #[test]
    fn path_resolution_rejects_invalid_names() {
        assert!(namespace_name_from_path("/ws", "default", "/ws/Chat").is_err());
        assert!(namespace_name_from_path("/ws", "default", "/ws/9rooms").is_err());
    }
}
