//! WebSocket upgrade route
//!
//! Admission order per upgrade: resolve the namespace from the path, look
//! it up, authenticate, then register the connection and send
//! `sys:connected`. Failures close the socket with the contract's codes
//! (1008 unknown namespace, 4001 rejected principal). After admission this
//! module only pumps the two socket halves: the read loop feeds the
//! namespace dispatcher, the writer task drains the connection's queue.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::UpgradeRequest;
use crate::connection::{Connection, Outbound};
use crate::envelope::{Envelope, InboundFrame};
use crate::error::{close_code, FabricError};
use crate::server::{namespace_name_from_path, AUTH_FAILED, NS_NOT_FOUND};
use crate::AppState;

/// Upgrade routes mounted at the configured base path.
pub fn upgrade_router(base_path: &str) -> Router<AppState> {
    if base_path.is_empty() {
        Router::new()
            .route("/", get(ws_handler))
            .route("/*rest", get(ws_handler))
    } else {
        Router::new()
            .route(base_path, get(ws_handler))
            .route(&format!("{base_path}/*rest"), get(ws_handler))
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let resolved = namespace_name_from_path(
        &state.config.base_path,
        &state.config.default_namespace,
        uri.path(),
    );
    let request = UpgradeRequest::new(uri, headers);
    let max_payload = state.config.max_payload_bytes;

    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| handle_socket(socket, state, resolved, request))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    resolved: Result<String, FabricError>,
    request: UpgradeRequest,
) {
    let server = state.server.clone();
    let config = state.config.clone();

    let namespace_name = match resolved {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!(err = %e, "Upgrade rejected: bad namespace path");
            close_with(socket, close_code::POLICY_VIOLATION, NS_NOT_FOUND).await;
            return;
        }
    };
    let Some(namespace) = server.namespace(&namespace_name).await else {
        tracing::warn!(namespace = %namespace_name, "Upgrade rejected: unknown namespace");
        close_with(socket, close_code::POLICY_VIOLATION, NS_NOT_FOUND).await;
        return;
    };

    let principal = match server.auth().authenticate(&request).await {
        Ok(principal) => principal,
        Err(e) => {
            tracing::warn!(namespace = %namespace_name, err = %e, "Upgrade rejected: authentication failed");
            close_with(socket, close_code::AUTH_FAILED, AUTH_FAILED).await;
            return;
        }
    };

    let (connection, outbound_rx) = Connection::new(server.instance_id().clone(), Some(principal));
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(writer_pump(sink, outbound_rx, connection.clone()));

    if let Err(e) = namespace.add_connection(&connection).await {
        tracing::error!(
            namespace = %namespace.name,
            connection_id = %connection.id,
            err = %e,
            "Connection registration failed"
        );
        connection.close(close_code::INTERNAL_ERROR, "registration failed");
        let _ = writer.await;
        return;
    }

    let user = connection
        .principal
        .as_ref()
        .map(|p| json!({ "id": p.user_id, "name": p.display_name }));
    let connected = Envelope::new(
        &namespace.name,
        "sys:connected",
        json!({
            "sid": connection.id,
            "user": user,
            "version": env!("CARGO_PKG_VERSION"),
        }),
    );
    let _ = connection.send(&connected);
    connection.mark_open();
    server.services().metrics.record_connection_opened();

    tracing::info!(
        namespace = %namespace.name,
        connection_id = %connection.id,
        user_id = connection.user_id().unwrap_or("-"),
        "WebSocket connection established"
    );

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if connection.register_inbound(config.max_msgs_per_second) {
                    tracing::warn!(
                        namespace = %namespace.name,
                        connection_id = %connection.id,
                        user_id = connection.user_id().unwrap_or("-"),
                        limit = config.max_msgs_per_second,
                        "Rate limit exceeded, closing"
                    );
                    server.services().metrics.record_rate_limit_termination();
                    connection.close(close_code::RATE_LIMIT, "rate limit exceeded");
                    break;
                }
                if text.len() > config.max_payload_bytes {
                    namespace
                        .send_error(&connection, &FabricError::Protocol("payload too large".into()))
                        .await;
                    continue;
                }
                match InboundFrame::parse(&text) {
                    Ok(frame) => namespace.handle_event(&connection, frame).await,
                    Err(e) => namespace.send_error(&connection, &e).await,
                }
            }
            Ok(Message::Binary(_)) => {
                namespace
                    .send_error(
                        &connection,
                        &FabricError::Protocol("binary frames not supported".into()),
                    )
                    .await;
            }
            Ok(Message::Pong(_)) => connection.mark_pong(),
            // The transport layer answers PINGs with PONGs on its own.
            Ok(Message::Ping(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(
                    namespace = %namespace.name,
                    connection_id = %connection.id,
                    err = %e,
                    "Socket read ended"
                );
                break;
            }
        }
    }

    namespace.remove_connection(&connection).await;
    connection.terminate();
    server.services().metrics.record_connection_closed();
    let _ = writer.await;

    tracing::info!(
        namespace = %namespace.name,
        connection_id = %connection.id,
        "WebSocket connection closed"
    );
}

/// Single writer per socket: everything queued on the connection leaves
/// here, in order, and nothing else touches the write half.
async fn writer_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Ping(payload) => {
                if sink.send(Message::Ping(payload)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
            Outbound::Terminate => break,
        }
    }
    connection.mark_closed();
}

// ═══════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════

/// Fabric statistics: total connections plus per-namespace room membership.
/// GET /api/ws/stats
async fn ws_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut total = 0usize;
    let mut namespaces = Vec::new();
    for namespace in state.server.namespaces_snapshot().await {
        let connections = namespace.connection_count().await;
        total += connections;
        let mut rooms = Vec::new();
        for room in namespace.rooms_snapshot().await {
            rooms.push(json!({
                "room": room.name,
                "persistent": room.persistent,
                "local_members": room.local_member_count().await,
            }));
        }
        namespaces.push(json!({
            "namespace": namespace.name,
            "connections": connections,
            "rooms": rooms,
        }));
    }

    Json(json!({
        "status": "operational",
        "instance_id": state.server.instance_id().to_string(),
        "total_connections": total,
        "namespaces": namespaces,
    }))
}

pub fn stats_router() -> Router<AppState> {
    Router::new().route("/stats", get(ws_stats))
}
