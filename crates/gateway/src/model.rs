// BSD-2-Clause

//! Core data model: device/connection identifiers, scan results, interface
//! kinds, and RPC request/response shapes.

use serde::{Deserialize, Serialize};

/// 64-bit identifier unique per physical or virtual device.
pub type DeviceId = u64;

/// Opaque, process-scoped handle allocated by an adapter on connect.
/// Invalid after disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u64);

/// Adapter-specific string identifying how to reach one device on one
/// adapter instance. Not portable across adapter kinds.
pub type ConnectionString = String;

/// The five interface kinds a connection may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Rpc,
    Streaming,
    Tracing,
    Script,
    Debug,
}

impl InterfaceKind {
    pub const ALL: [InterfaceKind; 5] =
        [Self::Rpc, Self::Streaming, Self::Tracing, Self::Script, Self::Debug];

    /// `script`/`debug` are mutually exclusive with `stream`/`trace` on one
    /// connection.
    pub fn conflicts_with(&self, other: &InterfaceKind) -> bool {
        let group_a = matches!(self, Self::Script | Self::Debug);
        let group_b = matches!(other, Self::Streaming | Self::Tracing);
        let group_a_rev = matches!(other, Self::Script | Self::Debug);
        let group_b_rev = matches!(self, Self::Streaming | Self::Tracing);
        (group_a && group_b) || (group_a_rev && group_b_rev)
    }
}

/// One discovered device, as reported by a single adapter's scan sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub device_id: DeviceId,
    pub connection_string: ConnectionString,
    /// Higher is better.
    pub signal_strength: i32,
    /// Monotonic expiration instant, encoded as milliseconds since an
    /// adapter-local epoch so scan results remain `Serialize`.
    pub expiration_time_ms: u64,
    pub user_connected: bool,
    pub pending_data: bool,
    pub low_voltage: bool,
    pub adapter_index: usize,
    /// Transport-specific advertisement bytes, kept opaque to the core
    /// since broadcast layouts vary by adapter generation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_advertisement: Vec<u8>,
}

impl ScanResult {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiration_time_ms
    }
}

/// Capability flags an adapter declares at startup.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub supports_broadcast: bool,
    pub supports_streaming: bool,
    pub supports_tracing: bool,
    pub supports_debug: bool,
    pub supports_script: bool,
    pub supports_rpc: bool,
    pub requires_probe: bool,
    pub max_concurrent_connections: usize,
}

/// RPC request addressed to a tile on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub address: u8,
    pub rpc_id: u16,
    pub payload: Vec<u8>,
}

/// Maximum RPC payload length.
pub const MAX_RPC_PAYLOAD: usize = 20;

/// Reserved RPC IDs every tile implements.
pub const RPC_ID_TILE_INFO: u16 = 0x0004;
pub const RPC_ID_HARDWARE_VERSION: u16 = 0x0008;
pub const RPC_ID_RESET: u16 = 0x1002;

/// RPC response status byte, decoded into its four orthogonal bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus(pub u8);

impl RpcStatus {
    pub const BUSY: u8 = 0b0001;
    pub const ASYNC_PENDING: u8 = 0b0010;
    pub const APP_ERROR: u8 = 0b0100;
    pub const HAS_PAYLOAD: u8 = 0b1000;

    pub fn busy(&self) -> bool {
        self.0 & Self::BUSY != 0
    }
    pub fn async_pending(&self) -> bool {
        self.0 & Self::ASYNC_PENDING != 0
    }
    pub fn app_error(&self) -> bool {
        self.0 & Self::APP_ERROR != 0
    }
    pub fn has_payload(&self) -> bool {
        self.0 & Self::HAS_PAYLOAD != 0
    }
}

/// RPC response status plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: RpcStatus,
    pub payload: Vec<u8>,
}

impl RpcRequest {
    pub fn validate(&self) -> crate::error::GatewayResult<()> {
        if self.payload.len() > MAX_RPC_PAYLOAD {
            return Err(crate::error::rpc_invalid_args(format!(
                "rpc payload too long: {} > {}",
                self.payload.len(),
                MAX_RPC_PAYLOAD
            )));
        }
        Ok(())
    }
}

/// A logical stream classification, taken from the top 4 bits of `stream_id`.
/// Informational only — the gateway does not inspect values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamClass {
    Input,
    Output,
    Buffered,
    Unbuffered,
    Counter,
    Constant,
    System,
    Unknown,
}

impl StreamClass {
    pub fn from_stream_id(stream_id: u16) -> Self {
        match stream_id >> 12 {
            0x0 => Self::Input,
            0x1 => Self::Output,
            0x2 => Self::Buffered,
            0x3 => Self::Unbuffered,
            0x4 => Self::Counter,
            0x5 => Self::Constant,
            0x6 => Self::System,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
