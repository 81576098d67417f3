// BSD-2-Clause

//! Per-connection state machine and retry policy.
//!
//! A connection moves `New -> Connected -> Disconnected` and never back;
//! a fresh connect call always allocates a fresh [`Connection`]. While
//! `Connected` it tracks which interfaces are open, enforcing that
//! `script`/`debug` and `stream`/`trace` never coexist on the same
//! connection.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use crate::error::{bad_argument, not_connected, tile_busy, GatewayResult};
use crate::model::{ConnectionHandle, DeviceId, InterfaceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connected,
    Disconnected,
}

pub struct Connection {
    pub handle: ConnectionHandle,
    pub device_id: DeviceId,
    state: ConnectionState,
    open_interfaces: HashSet<InterfaceKind>,
}

impl Connection {
    pub fn new(handle: ConnectionHandle, device_id: DeviceId) -> Self {
        Self { handle, device_id, state: ConnectionState::New, open_interfaces: HashSet::new() }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.open_interfaces.clear();
    }

    pub fn is_interface_open(&self, kind: InterfaceKind) -> bool {
        self.open_interfaces.contains(&kind)
    }

    pub fn open_interface(&mut self, kind: InterfaceKind) -> GatewayResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(not_connected(format!(
                "cannot open {kind:?} interface on a connection in state {:?}",
                self.state
            )));
        }
        for existing in &self.open_interfaces {
            if existing.conflicts_with(&kind) {
                return Err(bad_argument(format!(
                    "{kind:?} interface conflicts with already-open {existing:?} interface"
                )));
            }
        }
        self.open_interfaces.insert(kind);
        Ok(())
    }

    pub fn close_interface(&mut self, kind: InterfaceKind) {
        self.open_interfaces.remove(&kind);
    }
}

/// Bounded retry knobs for transient per-connection faults. Defaults match
/// the behavior exercised by the gateway's own retry loop: a tile reporting
/// busy is retried a handful of times with a short gap, an early BLE
/// disconnect during connect gets a few attempts, and a mid-session drop
/// triggers a bounded number of silent reconnect attempts before the
/// caller is notified.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub tile_busy_max_attempts: u32,
    pub tile_busy_retry_gap: Duration,
    pub early_disconnect_max_attempts: u32,
    pub silent_reconnect_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tile_busy_max_attempts: 4,
            tile_busy_retry_gap: Duration::from_millis(10),
            early_disconnect_max_attempts: 5,
            silent_reconnect_max_attempts: 3,
        }
    }
}

/// Retry `op` while it returns a `Busy`/`TileBusy` error, waiting
/// `policy.tile_busy_retry_gap` between attempts, up to
/// `policy.tile_busy_max_attempts` total attempts.
pub async fn retry_tile_busy<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind.retryable() && attempt < policy.tile_busy_max_attempts => {
                tokio::time::sleep(policy.tile_busy_retry_gap).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retry a connect attempt that may fail with an early disconnect, up to
/// `policy.early_disconnect_max_attempts` total attempts, with no delay
/// between attempts (the transport's own connect latency is the backoff).
pub async fn retry_early_disconnect<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.kind == crate::error::GatewayErrorKind::EarlyDisconnect
                    && attempt < policy.early_disconnect_max_attempts =>
            {
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Raise a [`crate::error::GatewayErrorKind::TileBusy`] error for a tile
/// that has exhausted its retry budget.
pub fn tile_busy_exhausted(address: u8, rpc_id: u16) -> crate::error::GatewayError {
    tile_busy(format!("tile {address:#x} rpc {rpc_id:#06x} still busy after retry budget"))
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
