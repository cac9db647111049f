//! Server lifecycle: heartbeat enforcement, graceful shutdown, HTTP surface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use common::*;
use roomcast::envelope::AccessLevel;
use roomcast::routes;
use roomcast::state::StateStore;
use roomcast::AppState;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_connection_is_terminated_by_heartbeat() {
    let cluster = TestCluster::new();
    let mut config = test_config();
    config.ping_interval = Duration::from_millis(30);
    config.pong_timeout = Duration::from_millis(20);
    let server = cluster.instance_with_config("a", config);
    let ns = server.register_namespace("chat").await.unwrap();
    server.start().await.unwrap();

    let (a, mut a_rx) = connect(&server, &ns, "alice", AccessLevel::User).await;
    assert_eq!(ns.connection_count().await, 1);

    // First sweep pings and arms the deadline; the second sees no pong and
    // terminates. No transport ever answers here.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(ns.connection_count().await, 0);
    assert!(cluster.state.get_all_clients().await.unwrap().is_empty());
    assert!(
        server.services().metrics.snapshot().heartbeat_terminations >= 1,
        "termination must be counted"
    );

    // The connection saw at least one PING before the drop.
    let mut saw_ping = false;
    while let Ok(outbound) = a_rx.try_recv() {
        if matches!(outbound, roomcast::connection::Outbound::Ping(_)) {
            saw_ping = true;
        }
    }
    assert!(saw_ping);
    assert_eq!(a.state(), roomcast::connection::ConnectionState::Closed);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pong_keeps_a_connection_alive() {
    let cluster = TestCluster::new();
    let mut config = test_config();
    config.ping_interval = Duration::from_millis(30);
    config.pong_timeout = Duration::from_millis(20);
    let server = cluster.instance_with_config("a", config);
    let ns = server.register_namespace("chat").await.unwrap();
    server.start().await.unwrap();

    let (a, _a_rx) = connect(&server, &ns, "alice", AccessLevel::User).await;

    // Answer every sweep, as the read loop does on Message::Pong.
    let keeper = {
        let a = a.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                a.mark_pong();
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(ns.connection_count().await, 1, "answering connection stays");

    keeper.abort();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_shutdown_closes_with_1001_and_purges_instance_rows() {
    let cluster = TestCluster::new();
    let server = cluster.instance("instance-a");
    let ns = server.register_namespace("chat").await.unwrap();
    server.start().await.unwrap();

    let mut receivers = Vec::new();
    for n in 0..5 {
        let (conn, rx) = connect(&server, &ns, &format!("user{n}"), AccessLevel::User).await;
        dispatch(&ns, &conn, "room:join", serde_json::json!({"roomName": "general"})).await;
        receivers.push(rx);
    }
    settle().await;
    assert_eq!(cluster.state.get_all_clients().await.unwrap().len(), 5);

    server.shutdown().await;

    for rx in receivers.iter_mut() {
        let close = drain_close(rx).expect("shutdown close frame");
        assert_eq!(close.0, 1001);
        assert_eq!(close.1, "server_shutdown");
    }
    assert!(cluster.state.get_all_clients().await.unwrap().is_empty());
    assert!(ns.room("general").await.is_none());
}

fn test_app(server: Arc<roomcast::server::WsServer>) -> axum::Router {
    let state = AppState {
        config: server.config().clone(),
        server,
    };
    axum::Router::new()
        .merge(routes::health::router())
        .nest("/api", routes::api_router())
        .with_state(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_routes_answer() {
    let cluster = TestCluster::new();
    let server = cluster.instance("a");
    server.register_namespace("chat").await.unwrap();
    let app = test_app(server);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "healthy");

    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ready = body_json(response).await;
    assert_eq!(ready["status"], "ready");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_route_reports_rooms_and_connections() {
    let cluster = TestCluster::new();
    let server = cluster.instance("a");
    let ns = server.register_namespace("chat").await.unwrap();
    let (a, _a_rx) = connect(&server, &ns, "alice", AccessLevel::User).await;
    dispatch(&ns, &a, "room:join", serde_json::json!({"roomName": "general"})).await;
    settle().await;

    let app = test_app(server);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/ws/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats = body_json(response).await;
    assert_eq!(stats["total_connections"], 1);
    assert_eq!(stats["namespaces"][0]["namespace"], "chat");
    assert_eq!(stats["namespaces"][0]["rooms"][0]["room"], "general");
    assert_eq!(stats["namespaces"][0]["rooms"][0]["local_members"], 1);
}
