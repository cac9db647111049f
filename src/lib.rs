//! Roomcast - clustered real-time messaging fabric
//!
//! Library exports for the binary and the integration tests. The actual
//! entry point is in main.rs.

use std::sync::Arc;

pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod monitoring;
pub mod namespace;
pub mod room;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod state;
pub mod utils;

use config::Config;
use server::WsServer;

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub server: Arc<WsServer>,
}
