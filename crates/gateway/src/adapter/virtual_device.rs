// BSD-2-Clause

//! In-process virtual device host: a [`DeviceAdapter`] backed entirely by
//! registered [`VirtualDevice`]s rather than a real transport. Used for
//! local testing and for device simulation without hardware.
//!
//! Each device exposes a set of addressed [`Tile`]s; each tile owns a
//! table of RPC handlers keyed by `rpc_id` plus the small state machine
//! (`configured`, `running`, `trapped`, `debug_mode`) every tile's
//! standard "tile info" RPC reports back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::adapter::base::AdapterBase;
use crate::adapter::{AdapterEvent, DeviceAdapter, ProgressCallback};
use crate::error::{
    bad_argument, internal, not_connected, rpc_not_found, tile_not_found, timeout as timeout_err, GatewayResult,
};
use crate::model::{
    AdapterCapabilities, ConnectionHandle, ConnectionString, DeviceId, InterfaceKind, RpcResponse, RpcStatus,
    ScanResult,
};
use crate::report::assembler::{ReportDemultiplexer, SubscriberKey};
use crate::report::{IndividualReport, Reading, Report};

/// A parsed `struct`-style response format field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatField {
    U8,
    U16,
    U32,
    Str(usize),
}

/// A value to encode against a [`FormatField`] of the same shape.
#[derive(Debug, Clone)]
pub enum FormatValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Str(Vec<u8>),
}

/// Parse a response format descriptor such as `"H6sBBBB"`: an optional
/// decimal count followed by a type character (`B` = u8, `H` = u16 little
/// endian, `L` = u32 little endian, `s` = fixed-width byte string whose
/// width is the count). A bare type character with no count is a single
/// field; a count before `s` is the string width; a count before any other
/// type repeats that field that many times.
fn parse_format_descriptor(descriptor: &str) -> GatewayResult<Vec<FormatField>> {
    let mut fields = Vec::new();
    let mut chars = descriptor.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            digits.push(chars.next().unwrap());
        }
        let Some(type_char) = chars.next() else {
            return Err(bad_argument(format!("format descriptor '{descriptor}' ends with a dangling count")));
        };
        let count: usize = if digits.is_empty() { 1 } else { digits.parse().unwrap_or(1) };
        match type_char {
            's' => fields.push(FormatField::Str(count)),
            'B' => fields.extend(std::iter::repeat(FormatField::U8).take(count)),
            'H' => fields.extend(std::iter::repeat(FormatField::U16).take(count)),
            'L' => fields.extend(std::iter::repeat(FormatField::U32).take(count)),
            other => return Err(bad_argument(format!("unsupported format descriptor type '{other}'"))),
        }
    }
    Ok(fields)
}

/// Encode `values` against `descriptor`, returning the packed byte string.
pub fn encode_struct(descriptor: &str, values: &[FormatValue]) -> GatewayResult<Vec<u8>> {
    let fields = parse_format_descriptor(descriptor)?;
    if fields.len() != values.len() {
        return Err(bad_argument(format!(
            "format descriptor '{descriptor}' expects {} value(s), got {}",
            fields.len(),
            values.len()
        )));
    }
    let mut buf = Vec::new();
    for (field, value) in fields.iter().zip(values) {
        match (field, value) {
            (FormatField::U8, FormatValue::U8(v)) => buf.push(*v),
            (FormatField::U16, FormatValue::U16(v)) => buf.extend_from_slice(&v.to_le_bytes()),
            (FormatField::U32, FormatValue::U32(v)) => buf.extend_from_slice(&v.to_le_bytes()),
            (FormatField::Str(width), FormatValue::Str(bytes)) => {
                let mut slot = vec![0u8; *width];
                let take = bytes.len().min(*width);
                slot[..take].copy_from_slice(&bytes[..take]);
                buf.extend_from_slice(&slot);
            }
            _ => return Err(bad_argument("format descriptor field and value type do not match")),
        }
    }
    Ok(buf)
}

/// Sentinel first field of the standard tile-info response, historically
/// reserved to signal extended-format support.
const TILE_INFO_SENTINEL: u16 = 0xFFFF;

pub const RPC_ID_TILE_INFO: u16 = crate::model::RPC_ID_TILE_INFO;
pub const RPC_ID_HARDWARE_VERSION: u16 = crate::model::RPC_ID_HARDWARE_VERSION;
pub const RPC_ID_RESET: u16 = crate::model::RPC_ID_RESET;

/// A tile's RPC handler: given its own tile and the request payload,
/// produces the response payload or an error.
pub type RpcHandler = Arc<dyn Fn(&Tile, &[u8]) -> GatewayResult<Vec<u8>> + Send + Sync>;

/// One addressed RPC endpoint on a virtual device.
pub struct Tile {
    pub address: u8,
    name: [u8; 6],
    version: (u8, u8, u8),
    configured: AtomicBool,
    running: AtomicBool,
    trapped: AtomicBool,
    debug_mode: AtomicBool,
    handlers: RwLock<HashMap<u16, RpcHandler>>,
    pending: Mutex<HashMap<u16, oneshot::Sender<RpcResponse>>>,
}

impl Tile {
    pub fn new(address: u8, name: &str, version: (u8, u8, u8)) -> Arc<Self> {
        let mut name_bytes = [0u8; 6];
        let src = name.as_bytes();
        let take = src.len().min(6);
        name_bytes[..take].copy_from_slice(&src[..take]);

        let tile = Arc::new(Self {
            address,
            name: name_bytes,
            version,
            configured: AtomicBool::new(false),
            running: AtomicBool::new(false),
            trapped: AtomicBool::new(false),
            debug_mode: AtomicBool::new(false),
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });
        tile
    }

    pub fn set_configured(&self, value: bool) {
        self.configured.store(value, Ordering::Relaxed);
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Relaxed);
    }

    pub fn set_trapped(&self, value: bool) {
        self.trapped.store(value, Ordering::Relaxed);
    }

    pub fn set_debug_mode(&self, value: bool) {
        self.debug_mode.store(value, Ordering::Relaxed);
    }

    /// Bit-packed `{configured, running, trapped, debug_mode}` status byte
    /// reported by the standard tile-info RPC.
    pub fn status_byte(&self) -> u8 {
        let mut b = 0u8;
        if self.configured.load(Ordering::Relaxed) {
            b |= 0b0001;
        }
        if self.running.load(Ordering::Relaxed) {
            b |= 0b0010;
        }
        if self.trapped.load(Ordering::Relaxed) {
            b |= 0b0100;
        }
        if self.debug_mode.load(Ordering::Relaxed) {
            b |= 0b1000;
        }
        b
    }

    fn tile_info_payload(&self) -> GatewayResult<Vec<u8>> {
        encode_struct(
            "H6sBBBB",
            &[
                FormatValue::U16(TILE_INFO_SENTINEL),
                FormatValue::Str(self.name.to_vec()),
                FormatValue::U8(self.version.0),
                FormatValue::U8(self.version.1),
                FormatValue::U8(self.version.2),
                FormatValue::U8(self.status_byte()),
            ],
        )
    }

    /// Register or replace the handler for `rpc_id`.
    pub async fn register_handler(&self, rpc_id: u16, handler: RpcHandler) {
        self.handlers.write().await.insert(rpc_id, handler);
    }

    /// Dispatch `rpc_id` synchronously against this tile's handler table,
    /// falling back to the built-in handlers for the reserved RPC ids.
    pub async fn handle_rpc(&self, rpc_id: u16, payload: &[u8]) -> GatewayResult<RpcResponse> {
        if self.trapped.load(Ordering::Relaxed) {
            return Err(crate::error::rpc_invalid_response(format!(
                "tile {:#x} is trapped and cannot service rpc {rpc_id:#06x}",
                self.address
            )));
        }

        let handler = self.handlers.read().await.get(&rpc_id).cloned();
        let response_payload = match (rpc_id, handler) {
            (_, Some(handler)) => handler(self, payload)?,
            (RPC_ID_TILE_INFO, None) => self.tile_info_payload()?,
            (RPC_ID_HARDWARE_VERSION, None) => vec![self.version.0, self.version.1, self.version.2],
            (RPC_ID_RESET, None) => {
                self.set_running(false);
                Vec::new()
            }
            (_, None) => {
                return Err(rpc_not_found(format!(
                    "tile {:#x} has no handler for rpc {rpc_id:#06x}",
                    self.address
                )))
            }
        };

        let status = if response_payload.is_empty() { RpcStatus(0) } else { RpcStatus(RpcStatus::HAS_PAYLOAD) };
        Ok(RpcResponse { status, payload: response_payload })
    }

    /// Register a pending async RPC and wait for [`Tile::finish_async_rpc`]
    /// (or `timeout`) to resolve it.
    pub async fn begin_async_rpc(&self, rpc_id: u16, timeout: Duration) -> GatewayResult<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(rpc_id, tx);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(internal(format!("async rpc {rpc_id:#06x} sender dropped before completion"))),
            Err(_) => {
                self.pending.lock().await.remove(&rpc_id);
                Err(timeout_err(format!("async rpc {rpc_id:#06x} did not complete within the deadline")))
            }
        }
    }

    /// Complete a pending async RPC started with [`Tile::begin_async_rpc`].
    /// Returns `false` if there was no matching pending call.
    pub async fn finish_async_rpc(&self, rpc_id: u16, response: RpcResponse) -> bool {
        match self.pending.lock().await.remove(&rpc_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }
}

/// Emits readings from a virtual device into the shared report fan-out
/// pipeline, as if they had arrived over a streaming interface.
pub struct DeviceChannel {
    device_id: DeviceId,
    demux: Arc<ReportDemultiplexer>,
}

impl DeviceChannel {
    pub fn new(device_id: DeviceId, demux: Arc<ReportDemultiplexer>) -> Self {
        Self { device_id, demux }
    }

    pub async fn emit_reading(&self, selector: u16, reading: Reading) {
        let report = Report::Individual(IndividualReport {
            stream_id: reading.stream_id,
            reading_id: reading.reading_id,
            reading_timestamp: reading.timestamp,
            reading_value: reading.value,
            sent_timestamp: reading.timestamp,
        });
        let key: SubscriberKey = (self.device_id, selector);
        self.demux.dispatch(key, Arc::new(report)).await;
    }
}

/// One simulated device: a set of addressed tiles plus its report channel.
pub struct VirtualDevice {
    pub device_id: DeviceId,
    tiles: RwLock<HashMap<u8, Arc<Tile>>>,
    pub channel: DeviceChannel,
}

impl VirtualDevice {
    pub fn new(device_id: DeviceId, demux: Arc<ReportDemultiplexer>) -> Arc<Self> {
        Arc::new(Self { device_id, tiles: RwLock::new(HashMap::new()), channel: DeviceChannel::new(device_id, demux) })
    }

    pub async fn add_tile(&self, tile: Arc<Tile>) {
        self.tiles.write().await.insert(tile.address, tile);
    }

    pub async fn tile(&self, address: u8) -> GatewayResult<Arc<Tile>> {
        self.tiles
            .read()
            .await
            .get(&address)
            .cloned()
            .ok_or_else(|| tile_not_found(format!("no tile at address {address:#x} on device {:#x}", self.device_id)))
    }
}

/// A [`DeviceAdapter`] whose devices are entirely in-process [`VirtualDevice`]s.
pub struct VirtualDeviceAdapter {
    base: AdapterBase,
    devices: RwLock<HashMap<DeviceId, Arc<VirtualDevice>>>,
    connections: RwLock<HashMap<ConnectionHandle, DeviceId>>,
}

impl VirtualDeviceAdapter {
    pub fn new() -> Self {
        Self { base: AdapterBase::new(), devices: RwLock::new(HashMap::new()), connections: RwLock::new(HashMap::new()) }
    }

    pub async fn register_device(&self, device: Arc<VirtualDevice>) {
        self.devices.write().await.insert(device.device_id, device);
    }

    async fn device_for(&self, handle: ConnectionHandle) -> GatewayResult<Arc<VirtualDevice>> {
        let device_id = *self
            .connections
            .read()
            .await
            .get(&handle)
            .ok_or_else(|| not_connected(format!("no virtual device connection for handle {}", handle.0)))?;
        self.devices
            .read()
            .await
            .get(&device_id)
            .cloned()
            .ok_or_else(|| not_connected(format!("virtual device {device_id:#x} was unregistered mid-connection")))
    }
}

impl Default for VirtualDeviceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAdapter for VirtualDeviceAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_rpc: true,
            supports_streaming: true,
            supports_tracing: false,
            supports_debug: false,
            supports_script: false,
            supports_broadcast: false,
            requires_probe: false,
            max_concurrent_connections: usize::MAX,
        }
    }

    async fn start(&self) -> GatewayResult<()> {
        Ok(())
    }

    async fn stop(&self) -> GatewayResult<()> {
        Ok(())
    }

    async fn probe(&self) -> GatewayResult<()> {
        Ok(())
    }

    fn scan_results(&self) -> Vec<ScanResult> {
        Vec::new()
    }

    async fn connect(&self, connection_string: &ConnectionString) -> GatewayResult<ConnectionHandle> {
        let device_id: DeviceId = connection_string
            .parse()
            .map_err(|_| bad_argument(format!("virtual adapter connect string must be a device id, got {connection_string}")))?;
        if !self.devices.read().await.contains_key(&device_id) {
            return Err(crate::error::device_not_found(format!("no registered virtual device {device_id:#x}")));
        }
        let handle = self.base.allocate_handle();
        self.connections.write().await.insert(handle, device_id);
        Ok(handle)
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> GatewayResult<()> {
        self.connections.write().await.remove(&handle);
        Ok(())
    }

    async fn open_interface(&self, _handle: ConnectionHandle, _kind: InterfaceKind) -> GatewayResult<()> {
        Ok(())
    }

    async fn close_interface(&self, _handle: ConnectionHandle, _kind: InterfaceKind) -> GatewayResult<()> {
        Ok(())
    }

    async fn send_rpc(
        &self,
        handle: ConnectionHandle,
        address: u8,
        rpc_id: u16,
        payload: Vec<u8>,
        _timeout: Duration,
    ) -> GatewayResult<RpcResponse> {
        let device = self.device_for(handle).await?;
        let tile = device.tile(address).await?;
        tile.handle_rpc(rpc_id, &payload).await
    }

    async fn send_script(&self, _handle: ConnectionHandle, _data: Vec<u8>, _progress: ProgressCallback) -> GatewayResult<()> {
        Err(bad_argument("virtual devices do not accept scripts"))
    }

    async fn send_highspeed(&self, _handle: ConnectionHandle, _data: Vec<u8>) -> GatewayResult<()> {
        Err(bad_argument("virtual devices do not accept highspeed data"))
    }

    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<AdapterEvent> {
        self.base.subscribe()
    }
}

#[cfg(test)]
#[path = "virtual_device_tests.rs"]
mod tests;
