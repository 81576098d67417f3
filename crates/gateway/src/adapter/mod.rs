// BSD-2-Clause

//! `DeviceAdapter`: the single plug-in contract every transport implements,
//! plus the shared machinery adapters compose rather than inherit.

pub mod aggregating;
pub mod base;
pub mod connection;
pub mod virtual_device;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::GatewayResult;
use crate::model::{AdapterCapabilities, ConnectionHandle, ConnectionString, InterfaceKind, RpcResponse, ScanResult};

/// Progress callback for `send_script`: monotonically non-decreasing
/// `(sent, total)` pairs.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Events an adapter emits to its host, as a broadcast bus carrying
/// non-owning connection handles rather than registered closures over
/// session state.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Scan(Vec<ScanResult>),
    Report { handle: ConnectionHandle, bytes: Vec<u8> },
    Trace { handle: ConnectionHandle, bytes: Vec<u8> },
    Disconnect { handle: ConnectionHandle },
    Progress { handle: ConnectionHandle, sent: u64, total: u64 },
    Broadcast { device_id: Option<crate::model::DeviceId>, bytes: Vec<u8> },
}

/// The contract every transport backend implements.
///
/// Implementors compose [`base::AdapterBase`] for callback dispatch and
/// retry bookkeeping rather than sharing behavior through inheritance.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Capability flags declared at startup.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Scoped acquisition of transport resources, released on every exit
    /// path by the implementor's `stop`.
    async fn start(&self) -> GatewayResult<()>;
    async fn stop(&self) -> GatewayResult<()>;

    /// Force a fresh scan sweep.
    async fn probe(&self) -> GatewayResult<()>;

    /// Current scan table snapshot.
    fn scan_results(&self) -> Vec<ScanResult>;

    async fn connect(&self, connection_string: &ConnectionString) -> GatewayResult<ConnectionHandle>;
    async fn disconnect(&self, handle: ConnectionHandle) -> GatewayResult<()>;

    async fn open_interface(&self, handle: ConnectionHandle, kind: InterfaceKind) -> GatewayResult<()>;
    async fn close_interface(&self, handle: ConnectionHandle, kind: InterfaceKind) -> GatewayResult<()>;

    async fn send_rpc(
        &self,
        handle: ConnectionHandle,
        address: u8,
        rpc_id: u16,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> GatewayResult<RpcResponse>;

    async fn send_script(
        &self,
        handle: ConnectionHandle,
        data: Vec<u8>,
        progress: ProgressCallback,
    ) -> GatewayResult<()>;

    async fn send_highspeed(&self, handle: ConnectionHandle, data: Vec<u8>) -> GatewayResult<()>;

    /// Subscribe to this adapter's event bus.
    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent>;
}
