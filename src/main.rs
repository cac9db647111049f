//! Roomcast - clustered real-time messaging fabric over WebSocket

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomcast::auth::BearerAuthAdapter;
use roomcast::config::Config;
use roomcast::monitoring;
use roomcast::routes;
use roomcast::server::WsServer;
use roomcast::services::Services;
use roomcast::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing::info!("Starting Roomcast");
    tracing::info!("Environment: {}", config.environment);

    // Build the pluggable backends and the server
    let services = Services::from_config(config.clone()).await?;
    let metrics = services.metrics.clone();
    tracing::info!(
        instance_id = %services.instance_id,
        state = ?config.state_backend,
        broker = ?config.broker_backend,
        scheduler = ?config.scheduler_backend,
        "Services initialized"
    );

    let auth = Arc::new(BearerAuthAdapter::new(&config.jwt_secret));
    let server = WsServer::new(services, auth);

    // Namespaces and persistent rooms exist before the listener accepts
    // upgrades, so no event loop can observe a missing default namespace.
    server.register_namespace(&config.default_namespace).await?;
    for name in &config.extra_namespaces {
        server.register_namespace(name).await?;
    }
    for declared in &config.persistent_rooms {
        let namespace = server.register_namespace(&declared.namespace).await?;
        let room = namespace
            .declare_persistent_room(&declared.room, Vec::new())
            .await?;
        if !config.presence_interval.is_zero() {
            room.schedule_task(room.presence_task(config.presence_interval))
                .await?;
        }
        tracing::info!(
            namespace = %declared.namespace,
            room = %declared.room,
            "Persistent room declared"
        );
    }

    server.start().await?;

    // CORS: explicit origins in production, permissive otherwise
    let cors = if config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let parsed: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::error!("Failed to parse CORS origin '{}': {}", origin, e);
                    None
                }
            })
            .collect();
        CorsLayer::new().allow_origin(parsed)
    };

    let state = AppState {
        config: config.clone(),
        server: server.clone(),
    };

    // Layer order: tracing wraps everything, CORS runs inside it.
    let middleware = tower::ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let app = Router::new()
        .merge(routes::health::router())
        .nest("/api", routes::api_router())
        .merge(routes::ws::upgrade_router(&config.base_path))
        .nest_service("/monitoring", monitoring::router().with_state(metrics))
        .layer(middleware)
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    tracing::info!(
        "WebSocket endpoint: ws://{}{}/<namespace>?token=<jwt>",
        config.listen_addr,
        config.base_path
    );

    // One cancellation signal: closing the fabric lets the long-lived
    // sockets finish, which in turn lets axum's graceful shutdown resolve.
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Shutdown signal listener failed: {}", e);
                return;
            }
            tracing::info!("Shutdown signal received");
            server.shutdown().await;
            let _ = closed_tx.send(());
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = closed_rx.await;
        })
        .await?;

    Ok(())
}
