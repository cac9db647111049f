//! HTTP/WS routes

pub mod health;
pub mod ws;

use axum::Router;

use crate::AppState;

/// Routes nested under `/api`.
pub fn api_router() -> Router<AppState> {
    Router::new().nest("/ws", ws::stats_router())
}
