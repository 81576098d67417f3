// BSD-2-Clause

//! `DeviceManager`: the session layer arbitrating access to devices across
//! concurrent clients.
//!
//! A session owns zero or more devices; a device is owned by at most one
//! session process-wide, so a second session's connect attempt on an
//! already-owned device fails with `DeviceInUse` rather than silently
//! sharing the connection. Locks are always taken in the order
//! `sessions -> device_owners -> device_handles` to avoid deadlocking
//! against the adapter's own internal locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{AdapterEvent, DeviceAdapter};
use crate::error::{cancelled, device_in_use, not_connected, GatewayResult};
use crate::model::{ConnectionHandle, DeviceId, InterfaceKind, RpcResponse, ScanResult};
use crate::report::assembler::{decode_frame, ReportAssembler, ReportDemultiplexer, SubscriberHandle, SubscriberKey};
use crate::report::Report;

pub type SessionId = Uuid;

#[derive(Default)]
struct SessionState {
    open_devices: HashSet<DeviceId>,
    broadcast_monitor: bool,
}

/// Await `op`, or return `Cancelled` as soon as `cancel` fires, whichever
/// comes first.
async fn with_cancellation<T>(
    cancel: &CancellationToken,
    op: impl std::future::Future<Output = GatewayResult<T>>,
) -> GatewayResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled("operation cancelled")),
        result = op => result,
    }
}

pub struct DeviceManager {
    adapter: Arc<dyn DeviceAdapter>,
    demux: Arc<ReportDemultiplexer>,
    sessions: RwLock<HashMap<SessionId, SessionState>>,
    device_owners: RwLock<HashMap<DeviceId, SessionId>>,
    device_handles: RwLock<HashMap<DeviceId, ConnectionHandle>>,
    handle_devices: Arc<RwLock<HashMap<ConnectionHandle, DeviceId>>>,
    subscriber_queue_capacity: usize,
    report_bridge: JoinHandle<()>,
}

impl DeviceManager {
    pub fn new(
        adapter: Arc<dyn DeviceAdapter>,
        demux: Arc<ReportDemultiplexer>,
        subscriber_queue_capacity: usize,
        max_report_bytes: usize,
    ) -> Self {
        let handle_devices: Arc<RwLock<HashMap<ConnectionHandle, DeviceId>>> = Arc::new(RwLock::new(HashMap::new()));
        let report_bridge = spawn_report_bridge(
            Arc::clone(&adapter),
            Arc::clone(&demux),
            Arc::clone(&handle_devices),
            max_report_bytes,
        );
        Self {
            adapter,
            demux,
            sessions: RwLock::new(HashMap::new()),
            device_owners: RwLock::new(HashMap::new()),
            device_handles: RwLock::new(HashMap::new()),
            handle_devices,
            subscriber_queue_capacity,
            report_bridge,
        }
    }

    pub async fn session_open(&self) -> SessionId {
        let session_id = Uuid::new_v4();
        self.sessions.write().await.insert(session_id, SessionState::default());
        session_id
    }

    /// Tear down a session: disconnect every device it still owns and drop
    /// its broadcast-monitor registration.
    pub async fn session_close(&self, session_id: SessionId) -> GatewayResult<()> {
        let open_devices = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id).map(|s| s.open_devices).unwrap_or_default()
        };
        for device_id in open_devices {
            let _ = self.disconnect(session_id, device_id).await;
        }
        Ok(())
    }

    pub async fn scan(&self, cancel: &CancellationToken) -> GatewayResult<Vec<ScanResult>> {
        with_cancellation(cancel, async {
            self.adapter.probe().await?;
            Ok(self.adapter.scan_results())
        })
        .await
    }

    /// Connect `session_id` to `device_id`. Idempotent if the session
    /// already owns the device; fails with `DeviceInUse` if a different
    /// session owns it.
    pub async fn connect(
        &self,
        session_id: SessionId,
        device_id: DeviceId,
        cancel: &CancellationToken,
    ) -> GatewayResult<ConnectionHandle> {
        {
            let owners = self.device_owners.read().await;
            match owners.get(&device_id) {
                Some(owner) if *owner == session_id => {
                    drop(owners);
                    if let Some(handle) = self.device_handles.read().await.get(&device_id) {
                        return Ok(*handle);
                    }
                }
                Some(_) => return Err(device_in_use(format!("device {device_id:#x} is already connected by another session"))),
                None => {}
            }
        }

        let handle = with_cancellation(cancel, async { self.adapter.connect(&device_id.to_string()).await }).await?;

        self.device_owners.write().await.insert(device_id, session_id);
        self.device_handles.write().await.insert(device_id, handle);
        self.handle_devices.write().await.insert(handle, device_id);
        if let Some(state) = self.sessions.write().await.get_mut(&session_id) {
            state.open_devices.insert(device_id);
        }
        Ok(handle)
    }

    pub async fn disconnect(&self, session_id: SessionId, device_id: DeviceId) -> GatewayResult<()> {
        self.require_ownership(session_id, device_id).await?;
        let handle = self
            .device_handles
            .write()
            .await
            .remove(&device_id)
            .ok_or_else(|| not_connected(format!("device {device_id:#x} is not connected")))?;
        self.device_owners.write().await.remove(&device_id);
        self.handle_devices.write().await.remove(&handle);
        if let Some(state) = self.sessions.write().await.get_mut(&session_id) {
            state.open_devices.remove(&device_id);
        }
        self.adapter.disconnect(handle).await
    }

    async fn require_ownership(&self, session_id: SessionId, device_id: DeviceId) -> GatewayResult<()> {
        match self.device_owners.read().await.get(&device_id) {
            Some(owner) if *owner == session_id => Ok(()),
            Some(_) => Err(device_in_use(format!("device {device_id:#x} is owned by another session"))),
            None => Err(not_connected(format!("device {device_id:#x} is not connected"))),
        }
    }

    pub async fn send_rpc(
        &self,
        session_id: SessionId,
        device_id: DeviceId,
        address: u8,
        rpc_id: u16,
        payload: Vec<u8>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> GatewayResult<RpcResponse> {
        self.require_ownership(session_id, device_id).await?;
        let handle = *self
            .device_handles
            .read()
            .await
            .get(&device_id)
            .ok_or_else(|| not_connected(format!("device {device_id:#x} is not connected")))?;
        with_cancellation(cancel, self.adapter.send_rpc(handle, address, rpc_id, payload, timeout)).await
    }

    /// Subscribe to assembled reports for `device_id` under `selector`
    /// (`0` for unselected streaming data).
    pub async fn subscribe(
        &self,
        device_id: DeviceId,
        selector: u16,
    ) -> (Arc<SubscriberHandle>, mpsc::Receiver<Arc<Report>>) {
        let key: SubscriberKey = (device_id, selector);
        self.demux.subscribe(key, self.subscriber_queue_capacity).await
    }

    /// Toggle whether `session_id` receives broadcast reports (reports
    /// with no single owning session).
    pub async fn set_broadcast_monitor(&self, session_id: SessionId, enabled: bool) -> GatewayResult<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_connected(format!("unknown session {session_id}")))?;
        state.broadcast_monitor = enabled;
        Ok(())
    }

    pub async fn is_broadcast_monitor(&self, session_id: SessionId) -> bool {
        self.sessions.read().await.get(&session_id).map(|s| s.broadcast_monitor).unwrap_or(false)
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.report_bridge.abort();
    }
}

/// Background task bridging the adapter's raw `Report`/`Trace` fragment
/// events into the demultiplexer: one [`ReportAssembler`] per connection
/// handle, fed in order, its completed frames decoded and dispatched under
/// the owning device's id.
fn spawn_report_bridge(
    adapter: Arc<dyn DeviceAdapter>,
    demux: Arc<ReportDemultiplexer>,
    handle_devices: Arc<RwLock<HashMap<ConnectionHandle, DeviceId>>>,
    max_report_bytes: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = adapter.subscribe_events();
        let mut assemblers: HashMap<ConnectionHandle, ReportAssembler> = HashMap::new();
        loop {
            match rx.recv().await {
                Ok(AdapterEvent::Report { handle, bytes }) => {
                    feed_fragment(&adapter, &demux, &handle_devices, &mut assemblers, handle, bytes, InterfaceKind::Streaming, max_report_bytes)
                        .await;
                }
                Ok(AdapterEvent::Trace { handle, bytes }) => {
                    feed_fragment(&adapter, &demux, &handle_devices, &mut assemblers, handle, bytes, InterfaceKind::Tracing, max_report_bytes)
                        .await;
                }
                Ok(AdapterEvent::Disconnect { handle }) => {
                    assemblers.remove(&handle);
                }
                Ok(AdapterEvent::Scan(_) | AdapterEvent::Progress { .. } | AdapterEvent::Broadcast { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn feed_fragment(
    adapter: &Arc<dyn DeviceAdapter>,
    demux: &Arc<ReportDemultiplexer>,
    handle_devices: &Arc<RwLock<HashMap<ConnectionHandle, DeviceId>>>,
    assemblers: &mut HashMap<ConnectionHandle, ReportAssembler>,
    handle: ConnectionHandle,
    bytes: Vec<u8>,
    kind: InterfaceKind,
    max_report_bytes: usize,
) {
    let Some(device_id) = handle_devices.read().await.get(&handle).copied() else {
        return;
    };

    let assembler = assemblers.entry(handle).or_insert_with(|| ReportAssembler::new(max_report_bytes));
    let frames = match assembler.push_fragment(handle.0, &bytes) {
        Ok(frames) => frames,
        Err(err) => {
            tracing::warn!(handle = handle.0, %err, "dropping malformed report stream, closing interface");
            assemblers.remove(&handle);
            let _ = adapter.close_interface(handle, kind).await;
            return;
        }
    };

    for frame in frames {
        match decode_frame(&frame) {
            Ok(report) => {
                let selector = match &report {
                    Report::Individual(_) => 0,
                    Report::SignedList(r) => r.selector,
                };
                demux.dispatch((device_id, selector), Arc::new(report)).await;
            }
            Err(err) => {
                tracing::warn!(handle = handle.0, %err, "dropping undecodable report frame");
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
