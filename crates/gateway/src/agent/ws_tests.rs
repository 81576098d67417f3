use super::*;
use crate::adapter::virtual_device::VirtualDeviceAdapter;
use crate::report::assembler::ReportDemultiplexer;

fn manager() -> Arc<DeviceManager> {
    Arc::new(DeviceManager::new(Arc::new(VirtualDeviceAdapter::new()), Arc::new(ReportDemultiplexer::new()), 16, 4096))
}

#[test]
fn ok_response_serializes_without_an_error_field() {
    let response = WsResponse::ok("t1".to_string(), serde_json::json!({"a": 1}));
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["ok"], true);
    assert!(value.get("error").is_none());
}

#[test]
fn err_response_serializes_without_a_result_field() {
    let response = WsResponse::err("t1".to_string(), bad_argument("bad"));
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["ok"], false);
    assert!(value.get("result").is_none());
    assert_eq!(value["error"]["kind"], "bad_argument");
}

#[tokio::test]
async fn dispatch_rejects_unknown_operations() {
    let manager = manager();
    let session = manager.session_open().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut subs = Vec::new();
    let request = WsRequest { op: "not_a_real_op".to_string(), args: serde_json::Value::Null, token: "t1".to_string() };
    let err = dispatch(&manager, session, request, &tx, &mut subs).await.unwrap_err();
    assert_eq!(err.kind, crate::error::GatewayErrorKind::BadArgument);
}

#[tokio::test]
async fn dispatch_scan_returns_an_empty_list_with_no_devices() {
    let manager = manager();
    let session = manager.session_open().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut subs = Vec::new();
    let request = WsRequest { op: "scan".to_string(), args: serde_json::Value::Null, token: "t1".to_string() };
    let result = dispatch(&manager, session, request, &tx, &mut subs).await.unwrap();
    assert_eq!(result, serde_json::json!([]));
}
