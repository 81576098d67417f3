// BSD-2-Clause

//! `GatewayAgent`: the network-facing façade in front of the session layer.
//! Currently ships one surface — a JSON/WebSocket RPC endpoint at `/ws` plus
//! a liveness probe at `/healthz` — behind a single [`axum::Router`] that the
//! runtime binds and serves.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::session::DeviceManager;

/// Build the router every transport-facing surface is mounted on, sharing
/// one [`DeviceManager`] as state.
pub fn router(manager: Arc<DeviceManager>) -> Router {
    Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/healthz", get(http::healthz))
        .layer(CorsLayer::permissive())
        .with_state(manager)
}
