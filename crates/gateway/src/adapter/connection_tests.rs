use super::*;
use crate::error::{early_disconnect, internal, tile_busy, GatewayErrorKind};
use std::sync::atomic::{AtomicU32, Ordering};

#[test]
fn new_connection_rejects_interface_open_before_connect() {
    let mut conn = Connection::new(ConnectionHandle(1), 1);
    let err = conn.open_interface(InterfaceKind::Rpc).unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::NotConnected);
}

#[test]
fn script_and_streaming_conflict_on_the_same_connection() {
    let mut conn = Connection::new(ConnectionHandle(1), 1);
    conn.mark_connected();
    conn.open_interface(InterfaceKind::Script).unwrap();
    let err = conn.open_interface(InterfaceKind::Streaming).unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::BadArgument);
}

#[test]
fn rpc_and_streaming_coexist() {
    let mut conn = Connection::new(ConnectionHandle(1), 1);
    conn.mark_connected();
    conn.open_interface(InterfaceKind::Rpc).unwrap();
    conn.open_interface(InterfaceKind::Streaming).unwrap();
    assert!(conn.is_interface_open(InterfaceKind::Rpc));
    assert!(conn.is_interface_open(InterfaceKind::Streaming));
}

#[test]
fn disconnect_clears_open_interfaces() {
    let mut conn = Connection::new(ConnectionHandle(1), 1);
    conn.mark_connected();
    conn.open_interface(InterfaceKind::Rpc).unwrap();
    conn.mark_disconnected();
    assert!(!conn.is_interface_open(InterfaceKind::Rpc));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn tile_busy_retry_gives_up_after_max_attempts() {
    let policy = RetryPolicy { tile_busy_max_attempts: 3, tile_busy_retry_gap: Duration::from_millis(1), ..Default::default() };
    let calls = AtomicU32::new(0);
    let result: GatewayResult<()> = retry_tile_busy(&policy, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(tile_busy("still busy")) }
    })
    .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn tile_busy_retry_succeeds_once_unblocked() {
    let policy = RetryPolicy::default();
    let calls = AtomicU32::new(0);
    let result = retry_tile_busy(&policy, || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(tile_busy("busy"))
            } else {
                Ok(42)
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(result, 42);
}

#[tokio::test]
async fn early_disconnect_retry_stops_on_unrelated_error() {
    let policy = RetryPolicy::default();
    let calls = AtomicU32::new(0);
    let result: GatewayResult<()> = retry_early_disconnect(&policy, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(internal("unrelated failure")) }
    })
    .await;
    let err = result.unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::Internal);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn early_disconnect_retry_exhausts_budget() {
    let policy = RetryPolicy { early_disconnect_max_attempts: 5, ..Default::default() };
    let calls = AtomicU32::new(0);
    let result: GatewayResult<()> = retry_early_disconnect(&policy, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(early_disconnect("dropped mid-connect")) }
    })
    .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}
