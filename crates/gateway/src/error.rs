// BSD-2-Clause

//! Error taxonomy for the gateway.
//!
//! Every fallible operation returns [`GatewayError`]: a stable [`GatewayErrorKind`]
//! plus a human-readable message and an optional structured detail map.
//! Retry policy is attached to the kind via [`GatewayErrorKind::retryable`]
//! so the call sites in `adapter::connection` can dispatch on it uniformly
//! instead of matching error strings.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, machine-readable error condition, named for the failure
/// condition it represents rather than for a Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
    // Transport errors
    DeviceNotFound,
    DeviceInUse,
    Disconnected,
    TransportUnavailable,
    Timeout,
    Busy,
    EarlyDisconnect,

    // Protocol errors
    RpcNotFound,
    RpcInvalidArgs,
    RpcInvalidResponse,
    TileBusy,
    TileNotFound,
    AsyncRpcInFlight,

    // Report errors
    SignatureInvalid,
    DecryptionFailed,
    MalformedReport,
    ReportTooLarge,
    KeyUnavailable,

    // Session errors
    NotConnected,
    InterfaceNotOpen,
    Cancelled,

    // Configuration errors
    UnknownAdapter,
    UnknownAgent,
    BadArgument,

    // Catch-all for adapter-local failures that don't map to a tighter kind.
    Internal,
}

impl GatewayErrorKind {
    /// Whether the adapter retry wheel may retry this condition locally
    /// without surfacing it to the caller.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::TileBusy | Self::Busy | Self::EarlyDisconnect | Self::Disconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::DeviceInUse => "DEVICE_IN_USE",
            Self::Disconnected => "DISCONNECTED",
            Self::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Busy => "BUSY",
            Self::EarlyDisconnect => "EARLY_DISCONNECT",
            Self::RpcNotFound => "RPC_NOT_FOUND",
            Self::RpcInvalidArgs => "RPC_INVALID_ARGS",
            Self::RpcInvalidResponse => "RPC_INVALID_RESPONSE",
            Self::TileBusy => "TILE_BUSY",
            Self::TileNotFound => "TILE_NOT_FOUND",
            Self::AsyncRpcInFlight => "ASYNC_RPC_IN_FLIGHT",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::DecryptionFailed => "DECRYPTION_FAILED",
            Self::MalformedReport => "MALFORMED_REPORT",
            Self::ReportTooLarge => "REPORT_TOO_LARGE",
            Self::KeyUnavailable => "KEY_UNAVAILABLE",
            Self::NotConnected => "NOT_CONNECTED",
            Self::InterfaceNotOpen => "INTERFACE_NOT_OPEN",
            Self::Cancelled => "CANCELLED",
            Self::UnknownAdapter => "UNKNOWN_ADAPTER",
            Self::UnknownAgent => "UNKNOWN_AGENT",
            Self::BadArgument => "BAD_ARGUMENT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gateway error: stable kind, human message, optional structured detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub detail: HashMap<String, String>,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), detail: HashMap::new() }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Shorthand constructors, one per kind, used pervasively at call sites.
macro_rules! error_ctor {
    ($name:ident => $kind:ident) => {
        pub fn $name(message: impl Into<String>) -> GatewayError {
            GatewayError::new(GatewayErrorKind::$kind, message)
        }
    };
}

error_ctor!(device_not_found => DeviceNotFound);
error_ctor!(device_in_use => DeviceInUse);
error_ctor!(disconnected => Disconnected);
error_ctor!(transport_unavailable => TransportUnavailable);
error_ctor!(timeout => Timeout);
error_ctor!(busy => Busy);
error_ctor!(early_disconnect => EarlyDisconnect);
error_ctor!(rpc_not_found => RpcNotFound);
error_ctor!(rpc_invalid_args => RpcInvalidArgs);
error_ctor!(rpc_invalid_response => RpcInvalidResponse);
error_ctor!(tile_busy => TileBusy);
error_ctor!(tile_not_found => TileNotFound);
error_ctor!(async_rpc_in_flight => AsyncRpcInFlight);
error_ctor!(signature_invalid => SignatureInvalid);
error_ctor!(decryption_failed => DecryptionFailed);
error_ctor!(malformed_report => MalformedReport);
error_ctor!(report_too_large => ReportTooLarge);
error_ctor!(key_unavailable => KeyUnavailable);
error_ctor!(not_connected => NotConnected);
error_ctor!(interface_not_open => InterfaceNotOpen);
error_ctor!(cancelled => Cancelled);
error_ctor!(unknown_adapter => UnknownAdapter);
error_ctor!(unknown_agent => UnknownAgent);
error_ctor!(bad_argument => BadArgument);
error_ctor!(internal => Internal);

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
