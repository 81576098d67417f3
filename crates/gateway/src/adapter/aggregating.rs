// BSD-2-Clause

//! `AggregatingAdapter`: presents several underlying adapters as one
//! logical adapter, merging their scan tables by device id and routing
//! connect calls across whichever adapter currently sees the device with
//! the strongest signal, falling back to the next-best contributor when a
//! connect attempt keeps failing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::adapter::base::AdapterBase;
use crate::adapter::{AdapterEvent, DeviceAdapter, ProgressCallback};
use crate::error::{device_not_found, internal, GatewayErrorKind, GatewayResult};
use crate::model::{AdapterCapabilities, ConnectionHandle, ConnectionString, DeviceId, InterfaceKind, RpcResponse, ScanResult};

/// One adapter's view of a device, contributing to a [`MergedScan`].
#[derive(Debug, Clone)]
pub struct ScanContributor {
    pub adapter_index: usize,
    pub connection_string: ConnectionString,
    pub signal_strength: i32,
    pub expiration_time_ms: u64,
}

/// A device's scan entry, merged across every adapter that currently sees
/// it. `contributors` is sorted by descending signal strength.
#[derive(Debug, Clone)]
pub struct MergedScan {
    pub device_id: DeviceId,
    pub contributors: Vec<ScanContributor>,
}

struct RoutedConnection {
    adapter_index: usize,
    local_handle: ConnectionHandle,
}

pub struct AggregatingAdapter {
    adapters: Vec<Arc<dyn DeviceAdapter>>,
    base: AdapterBase,
    max_connect_retries: u32,
    routed: Arc<RwLock<HashMap<ConnectionHandle, RoutedConnection>>>,
    reverse: Arc<RwLock<HashMap<(usize, ConnectionHandle), ConnectionHandle>>>,
    fanin_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AggregatingAdapter {
    pub fn new(adapters: Vec<Arc<dyn DeviceAdapter>>, max_connect_retries: u32) -> Self {
        Self {
            adapters,
            base: AdapterBase::new(),
            max_connect_retries: max_connect_retries.max(1),
            routed: Arc::new(RwLock::new(HashMap::new())),
            reverse: Arc::new(RwLock::new(HashMap::new())),
            fanin_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Merge every underlying adapter's current scan table by device id.
    pub fn merged_scan_results(&self) -> Vec<MergedScan> {
        let mut merged: HashMap<DeviceId, Vec<ScanContributor>> = HashMap::new();
        for (adapter_index, adapter) in self.adapters.iter().enumerate() {
            for result in adapter.scan_results() {
                merged.entry(result.device_id).or_default().push(ScanContributor {
                    adapter_index,
                    connection_string: result.connection_string,
                    signal_strength: result.signal_strength,
                    expiration_time_ms: result.expiration_time_ms,
                });
            }
        }
        merged
            .into_iter()
            .map(|(device_id, mut contributors)| {
                contributors.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
                MergedScan { device_id, contributors }
            })
            .collect()
    }

    fn candidates_for(&self, device_id: DeviceId) -> Vec<ScanContributor> {
        self.merged_scan_results()
            .into_iter()
            .find(|m| m.device_id == device_id)
            .map(|m| m.contributors)
            .unwrap_or_default()
    }

    async fn routed_connection(&self, handle: ConnectionHandle) -> GatewayResult<(Arc<dyn DeviceAdapter>, ConnectionHandle)> {
        let routed = self.routed.read().await;
        let entry = routed.get(&handle).ok_or_else(|| {
            crate::error::not_connected(format!("no aggregated connection for handle {}", handle.0))
        })?;
        Ok((Arc::clone(&self.adapters[entry.adapter_index]), entry.local_handle))
    }
}

async fn remap_event(
    adapter_index: usize,
    event: AdapterEvent,
    reverse: &RwLock<HashMap<(usize, ConnectionHandle), ConnectionHandle>>,
) -> Option<AdapterEvent> {
    let lookup = |local: ConnectionHandle| async move { reverse.read().await.get(&(adapter_index, local)).copied() };
    match event {
        AdapterEvent::Scan(_) | AdapterEvent::Broadcast { .. } => Some(event),
        AdapterEvent::Report { handle, bytes } => {
            lookup(handle).await.map(|global| AdapterEvent::Report { handle: global, bytes })
        }
        AdapterEvent::Trace { handle, bytes } => {
            lookup(handle).await.map(|global| AdapterEvent::Trace { handle: global, bytes })
        }
        AdapterEvent::Disconnect { handle } => {
            lookup(handle).await.map(|global| AdapterEvent::Disconnect { handle: global })
        }
        AdapterEvent::Progress { handle, sent, total } => {
            lookup(handle).await.map(|global| AdapterEvent::Progress { handle: global, sent, total })
        }
    }
}

#[async_trait::async_trait]
impl DeviceAdapter for AggregatingAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        self.adapters.iter().fold(AdapterCapabilities::default(), |mut acc, adapter| {
            let caps = adapter.capabilities();
            acc.supports_broadcast |= caps.supports_broadcast;
            acc.supports_streaming |= caps.supports_streaming;
            acc.supports_tracing |= caps.supports_tracing;
            acc.supports_debug |= caps.supports_debug;
            acc.supports_script |= caps.supports_script;
            acc.supports_rpc |= caps.supports_rpc;
            acc.requires_probe |= caps.requires_probe;
            acc.max_concurrent_connections += caps.max_concurrent_connections;
            acc
        })
    }

    async fn start(&self) -> GatewayResult<()> {
        for adapter in &self.adapters {
            adapter.start().await?;
        }
        let mut tasks = self.fanin_tasks.lock().await;
        for (adapter_index, adapter) in self.adapters.iter().enumerate() {
            let mut rx = adapter.subscribe_events();
            let sender = self.base.event_sender();
            let reverse = Arc::clone(&self.reverse);
            tasks.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if let Some(remapped) = remap_event(adapter_index, event, &reverse).await {
                                let _ = sender.send(remapped);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }));
        }
        Ok(())
    }

    async fn stop(&self) -> GatewayResult<()> {
        let mut tasks = self.fanin_tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        for adapter in &self.adapters {
            adapter.stop().await?;
        }
        Ok(())
    }

    async fn probe(&self) -> GatewayResult<()> {
        let results = join_all(self.adapters.iter().map(|a| a.probe())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    fn scan_results(&self) -> Vec<ScanResult> {
        self.merged_scan_results()
            .into_iter()
            .filter_map(|merged| {
                let best = merged.contributors.first()?;
                Some(ScanResult {
                    device_id: merged.device_id,
                    connection_string: best.connection_string.clone(),
                    signal_strength: best.signal_strength,
                    expiration_time_ms: merged.contributors.iter().map(|c| c.expiration_time_ms).max().unwrap_or(0),
                    user_connected: false,
                    pending_data: false,
                    low_voltage: false,
                    adapter_index: best.adapter_index,
                    raw_advertisement: Vec::new(),
                })
            })
            .collect()
    }

    async fn connect(&self, connection_string: &ConnectionString) -> GatewayResult<ConnectionHandle> {
        let device_id: DeviceId = connection_string
            .parse()
            .map_err(|_| internal(format!("aggregating adapter connect expects a device id, got {connection_string}")))?;

        let candidates = self.candidates_for(device_id);
        if candidates.is_empty() {
            return Err(device_not_found(format!("no adapter currently sees device {device_id:#x}")));
        }

        let mut attempts = 0u32;
        let mut candidate_idx = 0usize;
        loop {
            if candidate_idx >= candidates.len() || attempts >= self.max_connect_retries {
                return Err(device_not_found(format!(
                    "exhausted {attempts} connect attempts across {} candidate adapter(s) for device {device_id:#x}",
                    candidates.len()
                )));
            }
            let candidate = &candidates[candidate_idx];
            let adapter = Arc::clone(&self.adapters[candidate.adapter_index]);
            attempts += 1;
            tracing::info!(adapter_index = candidate.adapter_index, attempt = attempts, device_id = %format!("{device_id:#x}"), "attempting connect");
            match adapter.connect(&candidate.connection_string).await {
                Ok(local_handle) => {
                    let global_handle = self.base.allocate_handle();
                    self.routed.write().await.insert(
                        global_handle,
                        RoutedConnection { adapter_index: candidate.adapter_index, local_handle },
                    );
                    self.reverse.write().await.insert((candidate.adapter_index, local_handle), global_handle);
                    return Ok(global_handle);
                }
                Err(err) if err.kind == GatewayErrorKind::EarlyDisconnect => {
                    tracing::warn!(adapter_index = candidate.adapter_index, attempt = attempts, %err, "connect attempt saw an early disconnect, retrying same candidate");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(adapter_index = candidate.adapter_index, attempt = attempts, %err, "connect attempt failed, falling back to next candidate");
                    candidate_idx += 1;
                }
            }
        }
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> GatewayResult<()> {
        let (adapter, local_handle) = self.routed_connection(handle).await?;
        adapter.disconnect(local_handle).await?;
        let mut routed = self.routed.write().await;
        if let Some(entry) = routed.remove(&handle) {
            self.reverse.write().await.remove(&(entry.adapter_index, local_handle));
        }
        Ok(())
    }

    async fn open_interface(&self, handle: ConnectionHandle, kind: InterfaceKind) -> GatewayResult<()> {
        let (adapter, local_handle) = self.routed_connection(handle).await?;
        adapter.open_interface(local_handle, kind).await
    }

    async fn close_interface(&self, handle: ConnectionHandle, kind: InterfaceKind) -> GatewayResult<()> {
        let (adapter, local_handle) = self.routed_connection(handle).await?;
        adapter.close_interface(local_handle, kind).await
    }

    async fn send_rpc(
        &self,
        handle: ConnectionHandle,
        address: u8,
        rpc_id: u16,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> GatewayResult<RpcResponse> {
        let (adapter, local_handle) = self.routed_connection(handle).await?;
        adapter.send_rpc(local_handle, address, rpc_id, payload, timeout).await
    }

    async fn send_script(&self, handle: ConnectionHandle, data: Vec<u8>, progress: ProgressCallback) -> GatewayResult<()> {
        let (adapter, local_handle) = self.routed_connection(handle).await?;
        adapter.send_script(local_handle, data, progress).await
    }

    async fn send_highspeed(&self, handle: ConnectionHandle, data: Vec<u8>) -> GatewayResult<()> {
        let (adapter, local_handle) = self.routed_connection(handle).await?;
        adapter.send_highspeed(local_handle, data).await
    }

    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<AdapterEvent> {
        self.base.subscribe()
    }
}

#[cfg(test)]
#[path = "aggregating_tests.rs"]
mod tests;
