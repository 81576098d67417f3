//! Shared harness for the gateway's end-to-end scenario tests: spins up a
//! real `tilegate` agent router on an ephemeral loopback port, backed by an
//! in-process virtual device, and hands the caller a `ws://` URL to connect
//! a real client against.

use std::sync::Arc;

use tilegate::adapter::virtual_device::{Tile, VirtualDevice, VirtualDeviceAdapter};
use tilegate::adapter::DeviceAdapter;
use tilegate::model::DeviceId;
use tilegate::report::assembler::ReportDemultiplexer;
use tilegate::session::DeviceManager;

/// One running gateway instance plus the virtual device it was seeded with.
pub struct RunningGateway {
    pub ws_url: String,
    pub device: Arc<VirtualDevice>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for RunningGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Start a gateway with one virtual device at `device_id`, carrying a single
/// tile at address 8 named "Simple", version 1.0.0, configured and running.
pub async fn spawn_gateway(device_id: DeviceId) -> RunningGateway {
    let demux = Arc::new(ReportDemultiplexer::new());
    let device = VirtualDevice::new(device_id, Arc::clone(&demux));
    let tile = Tile::new(8, "Simple", (1, 0, 0));
    tile.set_configured(true);
    tile.set_running(true);
    device.add_tile(tile).await;

    let adapter = Arc::new(VirtualDeviceAdapter::new());
    adapter.register_device(Arc::clone(&device)).await;

    let manager = Arc::new(DeviceManager::new(adapter as Arc<dyn DeviceAdapter>, demux, 64, 1024 * 1024));
    let router = tilegate::agent::router(manager);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    RunningGateway { ws_url: format!("ws://{addr}/ws"), device, server }
}
