//! End-to-end scenario coverage for the gateway runtime: one test per
//! documented scenario, each driving the same public surface a real
//! embedder or client would use.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use tilegate::adapter::aggregating::AggregatingAdapter;
use tilegate::adapter::virtual_device::{RPC_ID_TILE_INFO, Tile, VirtualDevice, VirtualDeviceAdapter};
use tilegate::adapter::{AdapterEvent, DeviceAdapter, ProgressCallback};
use tilegate::error::{early_disconnect, GatewayErrorKind, GatewayResult};
use tilegate::model::{AdapterCapabilities, ConnectionHandle, ConnectionString, DeviceId, InterfaceKind, RpcResponse, ScanResult};
use tilegate::report::assembler::ReportDemultiplexer;
use tilegate::report::codec::{AuthProviderChain, AuthProvider, KeyPurpose};
use tilegate::report::{KeyType, Reading, ReportFlags, SignedListReport};
use tilegate::session::DeviceManager;
use tokio_util::sync::CancellationToken;

async fn ws_roundtrip(url: &str, request: serde_json::Value) -> serde_json::Value {
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    socket.send(Message::Text(request.to_string().into())).await.expect("send");
    loop {
        match socket.next().await.expect("stream closed early").expect("websocket error") {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid json response"),
            _ => continue,
        }
    }
}

// Scenario 1: virtual device RPC round trip.
#[tokio::test]
async fn virtual_device_rpc_round_trip() {
    let gateway = tilegate_specs::spawn_gateway(1).await;

    let connect = ws_roundtrip(
        &gateway.ws_url,
        serde_json::json!({"op": "connect", "args": {"device_id": 1}, "token": "c1"}),
    )
    .await;
    assert_eq!(connect["ok"], true);

    let rpc = ws_roundtrip(
        &gateway.ws_url,
        serde_json::json!({
            "op": "send_rpc",
            "args": {"device_id": 1, "address": 8, "rpc_id": RPC_ID_TILE_INFO, "payload": []},
            "token": "r1",
        }),
    )
    .await;
    assert_eq!(rpc["ok"], true);
    let payload: Vec<u8> = serde_json::from_value(rpc["result"]["payload"].clone()).unwrap();
    assert_eq!(payload, vec![0xff, 0xff, b'S', b'i', b'm', b'p', b'l', b'e', 1, 0, 0, 3]);
}

struct StaticKeyProvider(Vec<u8>);

#[async_trait::async_trait]
impl AuthProvider for StaticKeyProvider {
    async fn get_key(&self, _device_id: DeviceId, _key_type: KeyType, _purpose: KeyPurpose) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

// Scenario 2: tampering with a signed report's reading is caught on verify.
#[tokio::test]
async fn signed_list_tamper_is_detected() {
    let key = vec![0u8; 32];
    let providers = AuthProviderChain::new().push(Box::new(StaticKeyProvider(key)));

    let mut report = SignedListReport {
        device_id: 0x10,
        report_id: 7,
        sent_timestamp: 0,
        flags: ReportFlags { encrypted: false, key_type: KeyType::Device },
        selector: 0,
        readings: vec![
            Reading { stream_id: 0x1000, reading_id: 1, timestamp: 1000, value: 42 },
            Reading { stream_id: 0x1000, reading_id: 2, timestamp: 1005, value: 43 },
            Reading { stream_id: 0x1000, reading_id: 3, timestamp: 1010, value: 44 },
        ],
        lowest_reading_id: 1,
        highest_reading_id: 3,
        signature: [0u8; 16],
    };

    tilegate::report::codec::sign(&mut report, &providers).await.unwrap();
    assert!(tilegate::report::codec::verify(&report, &providers).await.unwrap());

    report.readings[1].value = 99;
    let err = tilegate::report::codec::verify(&report, &providers).await.unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::SignatureInvalid);
}

struct FlakyAdapter {
    failures_remaining: std::sync::atomic::AtomicU32,
    calls: std::sync::atomic::AtomicU32,
    handle: ConnectionHandle,
}

impl FlakyAdapter {
    fn new(failures: u32, handle: ConnectionHandle) -> Self {
        Self {
            failures_remaining: std::sync::atomic::AtomicU32::new(failures),
            calls: std::sync::atomic::AtomicU32::new(0),
            handle,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DeviceAdapter for FlakyAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
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
    async fn connect(&self, _connection_string: &ConnectionString) -> GatewayResult<ConnectionHandle> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.failures_remaining.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Err(early_disconnect("link dropped mid-handshake"));
        }
        Ok(self.handle)
    }
    async fn disconnect(&self, _handle: ConnectionHandle) -> GatewayResult<()> {
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
        _handle: ConnectionHandle,
        _address: u8,
        _rpc_id: u16,
        _payload: Vec<u8>,
        _timeout: Duration,
    ) -> GatewayResult<RpcResponse> {
        unimplemented!("not exercised by this scenario")
    }
    async fn send_script(&self, _handle: ConnectionHandle, _data: Vec<u8>, _progress: ProgressCallback) -> GatewayResult<()> {
        unimplemented!("not exercised by this scenario")
    }
    async fn send_highspeed(&self, _handle: ConnectionHandle, _data: Vec<u8>) -> GatewayResult<()> {
        unimplemented!("not exercised by this scenario")
    }
    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<AdapterEvent> {
        tokio::sync::broadcast::channel(1).1
    }
}

struct StaticScanAdapter {
    results: Vec<ScanResult>,
}

#[async_trait::async_trait]
impl DeviceAdapter for StaticScanAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
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
        self.results.clone()
    }
    async fn connect(&self, _connection_string: &ConnectionString) -> GatewayResult<ConnectionHandle> {
        panic!("b should never be dialed while a still has retry budget left")
    }
    async fn disconnect(&self, _handle: ConnectionHandle) -> GatewayResult<()> {
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
        _handle: ConnectionHandle,
        _address: u8,
        _rpc_id: u16,
        _payload: Vec<u8>,
        _timeout: Duration,
    ) -> GatewayResult<RpcResponse> {
        unimplemented!("not exercised by this scenario")
    }
    async fn send_script(&self, _handle: ConnectionHandle, _data: Vec<u8>, _progress: ProgressCallback) -> GatewayResult<()> {
        unimplemented!("not exercised by this scenario")
    }
    async fn send_highspeed(&self, _handle: ConnectionHandle, _data: Vec<u8>) -> GatewayResult<()> {
        unimplemented!("not exercised by this scenario")
    }
    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<AdapterEvent> {
        tokio::sync::broadcast::channel(1).1
    }
}

// Scenario 3: fallback connect prefers the strongest candidate across retries
// before ever trying the weaker one.
#[tokio::test]
async fn fallback_connect_retries_strongest_candidate_first() {
    let device_id: DeviceId = 5;
    let a = Arc::new(FlakyAdapter::new(3, ConnectionHandle(1)));
    let a_scan = Arc::new(StaticScanAdapter {
        results: vec![ScanResult {
            device_id,
            connection_string: device_id.to_string(),
            signal_strength: -40,
            expiration_time_ms: u64::MAX,
            user_connected: false,
            pending_data: false,
            low_voltage: false,
            adapter_index: 0,
            raw_advertisement: Vec::new(),
        }],
    });
    let b = Arc::new(StaticScanAdapter {
        results: vec![ScanResult {
            device_id,
            connection_string: device_id.to_string(),
            signal_strength: -80,
            expiration_time_ms: u64::MAX,
            user_connected: false,
            pending_data: false,
            low_voltage: false,
            adapter_index: 1,
            raw_advertisement: Vec::new(),
        }],
    });

    // `a` contributes both the scan entry and the flaky connect behavior;
    // `b` only ever contributes a (never-dialed) scan entry.
    struct CombinedA {
        scan: Arc<StaticScanAdapter>,
        connect: Arc<FlakyAdapter>,
    }
    #[async_trait::async_trait]
    impl DeviceAdapter for CombinedA {
        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities::default()
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
            self.scan.scan_results()
        }
        async fn connect(&self, connection_string: &ConnectionString) -> GatewayResult<ConnectionHandle> {
            self.connect.connect(connection_string).await
        }
        async fn disconnect(&self, handle: ConnectionHandle) -> GatewayResult<()> {
            self.connect.disconnect(handle).await
        }
        async fn open_interface(&self, handle: ConnectionHandle, kind: InterfaceKind) -> GatewayResult<()> {
            self.connect.open_interface(handle, kind).await
        }
        async fn close_interface(&self, handle: ConnectionHandle, kind: InterfaceKind) -> GatewayResult<()> {
            self.connect.close_interface(handle, kind).await
        }
        async fn send_rpc(
            &self,
            handle: ConnectionHandle,
            address: u8,
            rpc_id: u16,
            payload: Vec<u8>,
            timeout: Duration,
        ) -> GatewayResult<RpcResponse> {
            self.connect.send_rpc(handle, address, rpc_id, payload, timeout).await
        }
        async fn send_script(&self, handle: ConnectionHandle, data: Vec<u8>, progress: ProgressCallback) -> GatewayResult<()> {
            self.connect.send_script(handle, data, progress).await
        }
        async fn send_highspeed(&self, handle: ConnectionHandle, data: Vec<u8>) -> GatewayResult<()> {
            self.connect.send_highspeed(handle, data).await
        }
        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<AdapterEvent> {
            self.connect.subscribe_events()
        }
    }

    let combined_a = Arc::new(CombinedA { scan: a_scan, connect: Arc::clone(&a) });
    let adapters: Vec<Arc<dyn DeviceAdapter>> = vec![combined_a, b];
    let aggregate = AggregatingAdapter::new(adapters, 5);

    let handle = aggregate.connect(&device_id.to_string()).await.unwrap();
    assert_eq!(handle.0, 1);
    assert_eq!(a.calls(), 4);
}

// Scenario 4: a slow subscriber drops instead of blocking or starving a fast one.
#[tokio::test]
async fn multi_subscriber_fanout_backpressure() {
    let demux = ReportDemultiplexer::new();
    let device_id: DeviceId = 9;
    let key = (device_id, 0u16);

    let (fast_handle, mut fast_rx) = demux.subscribe(key, 128).await;
    let (slow_handle, mut slow_rx) = demux.subscribe(key, 1).await;

    for i in 0..100u32 {
        let report = Arc::new(tilegate::report::Report::Individual(tilegate::report::IndividualReport {
            stream_id: 0x1000,
            reading_id: i,
            reading_timestamp: i,
            reading_value: i,
            sent_timestamp: i,
        }));
        demux.dispatch(key, report).await;
    }

    let mut fast_received = 0;
    while fast_rx.try_recv().is_ok() {
        fast_received += 1;
    }
    assert_eq!(fast_received, 100);

    let mut slow_received = 0;
    while slow_rx.try_recv().is_ok() {
        slow_received += 1;
    }
    assert!(slow_received <= 1);
    assert_eq!(slow_handle.dropped_count(), 100 - slow_received as u64);
    assert_eq!(fast_handle.dropped_count(), 0);
}

// Scenario 5: a device is owned by at most one session at a time.
#[tokio::test]
async fn device_in_use_arbitration() {
    let demux = Arc::new(ReportDemultiplexer::new());
    let device = VirtualDevice::new(7, Arc::clone(&demux));
    let tile = Tile::new(8, "Simple", (1, 0, 0));
    tile.set_configured(true);
    tile.set_running(true);
    device.add_tile(tile).await;

    let adapter = Arc::new(VirtualDeviceAdapter::new());
    adapter.register_device(Arc::clone(&device)).await;
    let manager = DeviceManager::new(adapter as Arc<dyn DeviceAdapter>, demux, 16, 4096);
    let cancel = CancellationToken::new();

    let session_a = manager.session_open().await;
    let session_b = manager.session_open().await;

    manager.connect(session_a, 7, &cancel).await.unwrap();
    let err = manager.connect(session_b, 7, &cancel).await.unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::DeviceInUse);

    manager.disconnect(session_a, 7).await.unwrap();
    manager.connect(session_b, 7, &cancel).await.unwrap();
}

// Scenario 6: an async RPC suspends the caller until the tile finishes it,
// and times out with a bounded wait if the tile never does.
#[tokio::test]
async fn async_rpc_suspends_until_finished() {
    let tile = Tile::new(8, "Simple", (1, 0, 0));

    let finisher = Arc::clone(&tile);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        finisher
            .finish_async_rpc(0x9001, RpcResponse { status: tilegate::model::RpcStatus(0), payload: vec![1, 2, 3] })
            .await;
    });

    let response = tile.begin_async_rpc(0x9001, Duration::from_secs(1)).await.unwrap();
    assert_eq!(response.payload, vec![1, 2, 3]);
}

#[tokio::test]
async fn async_rpc_times_out_with_bounded_wait() {
    let tile = Tile::new(8, "Simple", (1, 0, 0));
    let started = tokio::time::Instant::now();
    let err = tile.begin_async_rpc(0x9001, Duration::from_millis(50)).await.unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_millis(250));
}
