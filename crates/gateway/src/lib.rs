// BSD-2-Clause

//! `tilegate`: a device gateway that aggregates one or more transport
//! adapters behind a single session layer and exposes them to network
//! clients over a JSON/WebSocket RPC surface.
//!
//! [`run`] is the whole wiring: load config -> build the adapter stack ->
//! start it -> bind the agent router -> serve until shutdown.

pub mod adapter;
pub mod agent;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod report;
pub mod session;

use std::sync::Arc;

use tracing::info;

use config::GatewayConfig;
use error::GatewayResult;
use registry::AdapterRegistry;
use report::assembler::ReportDemultiplexer;
use session::DeviceManager;

/// Run the gateway to completion: binds its listener and serves until the
/// process receives a shutdown signal or the listener itself fails.
pub async fn run(config: GatewayConfig) -> GatewayResult<()> {
    let document = config.load_document()?;
    let registry = AdapterRegistry::with_builtins();
    let adapter = registry.build(&document, config.max_connect_retries)?;
    adapter.start().await?;

    let demux = Arc::new(ReportDemultiplexer::new());
    let manager = Arc::new(DeviceManager::new(adapter, demux, config.subscriber_queue_capacity, config.max_report_bytes));
    let router = agent::router(Arc::clone(&manager));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| error::internal(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| error::internal(format!("gateway server error: {e}")))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
