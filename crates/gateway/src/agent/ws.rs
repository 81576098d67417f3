// BSD-2-Clause

//! WebSocket RPC façade: one `/ws` route carrying `{op, args, token}`
//! requests and `{token, ok, result}` / `{token, ok: false, error}`
//! responses. A session is opened when the socket connects and closed
//! when it disconnects; active `subscribe` calls push unsolicited
//! `{op: "report", ...}` frames for the lifetime of the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{bad_argument, GatewayError};
use crate::model::DeviceId;
use crate::session::DeviceManager;

#[derive(Debug, Deserialize)]
struct WsRequest {
    op: String,
    #[serde(default)]
    args: serde_json::Value,
    token: String,
}

#[derive(Debug, Serialize)]
struct WsResponse {
    token: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<GatewayError>,
}

impl WsResponse {
    fn ok(token: String, result: serde_json::Value) -> Self {
        Self { token, ok: true, result: Some(result), error: None }
    }

    fn err(token: String, error: GatewayError) -> Self {
        Self { token, ok: false, result: None, error: Some(error) }
    }
}

#[derive(Debug, Serialize)]
struct ReportPush {
    op: &'static str,
    device_id: DeviceId,
    selector: u16,
    report: crate::report::Report,
}

pub async fn upgrade(ws: WebSocketUpgrade, State(manager): State<Arc<DeviceManager>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<DeviceManager>) {
    let session_id = manager.session_open().await;
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let forward_task: JoinHandle<()> = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: Vec<JoinHandle<()>> = Vec::new();

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let request: WsRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed websocket request");
                continue;
            }
        };
        let token = request.token.clone();
        let response = match dispatch(&manager, session_id, request, &out_tx, &mut subscriptions).await {
            Ok(result) => WsResponse::ok(token, result),
            Err(e) => WsResponse::err(token, e),
        };
        if let Ok(text) = serde_json::to_string(&response) {
            let _ = out_tx.send(Message::Text(text));
        }
    }

    for task in subscriptions {
        task.abort();
    }
    forward_task.abort();
    let _ = manager.session_close(session_id).await;
    debug!(%session_id, "websocket session closed");
}

async fn dispatch(
    manager: &Arc<DeviceManager>,
    session_id: crate::session::SessionId,
    request: WsRequest,
    out_tx: &mpsc::UnboundedSender<Message>,
    subscriptions: &mut Vec<JoinHandle<()>>,
) -> crate::error::GatewayResult<serde_json::Value> {
    let cancel = CancellationToken::new();
    match request.op.as_str() {
        "scan" => {
            let results = manager.scan(&cancel).await?;
            Ok(serde_json::to_value(results).unwrap_or(serde_json::Value::Null))
        }
        "connect" => {
            #[derive(Deserialize)]
            struct Args {
                device_id: DeviceId,
            }
            let args: Args = parse_args(request.args)?;
            let handle = manager.connect(session_id, args.device_id, &cancel).await?;
            Ok(serde_json::json!({ "handle": handle.0 }))
        }
        "disconnect" => {
            #[derive(Deserialize)]
            struct Args {
                device_id: DeviceId,
            }
            let args: Args = parse_args(request.args)?;
            manager.disconnect(session_id, args.device_id).await?;
            Ok(serde_json::Value::Null)
        }
        "send_rpc" => {
            #[derive(Deserialize)]
            struct Args {
                device_id: DeviceId,
                address: u8,
                rpc_id: u16,
                #[serde(default)]
                payload: Vec<u8>,
                #[serde(default = "default_rpc_timeout_ms")]
                timeout_ms: u64,
            }
            let args: Args = parse_args(request.args)?;
            let response = manager
                .send_rpc(
                    session_id,
                    args.device_id,
                    args.address,
                    args.rpc_id,
                    args.payload,
                    Duration::from_millis(args.timeout_ms),
                    &cancel,
                )
                .await?;
            Ok(serde_json::json!({ "status": response.status.0, "payload": response.payload }))
        }
        "subscribe" => {
            #[derive(Deserialize)]
            struct Args {
                device_id: DeviceId,
                #[serde(default)]
                selector: u16,
            }
            let args: Args = parse_args(request.args)?;
            let (subscriber_handle, mut rx) = manager.subscribe(args.device_id, args.selector).await;
            let out_tx = out_tx.clone();
            subscriptions.push(tokio::spawn(async move {
                let _keep_alive = subscriber_handle;
                while let Some(report) = rx.recv().await {
                    let push = ReportPush { op: "report", device_id: args.device_id, selector: args.selector, report: (*report).clone() };
                    if let Ok(text) = serde_json::to_string(&push) {
                        if out_tx.send(Message::Text(text)).is_err() {
                            break;
                        }
                    }
                }
            }));
            Ok(serde_json::Value::Null)
        }
        "broadcast_monitor" => {
            #[derive(Deserialize)]
            struct Args {
                enabled: bool,
            }
            let args: Args = parse_args(request.args)?;
            manager.set_broadcast_monitor(session_id, args.enabled).await?;
            Ok(serde_json::Value::Null)
        }
        other => Err(bad_argument(format!("unknown operation '{other}'"))),
    }
}

fn default_rpc_timeout_ms() -> u64 {
    60_000
}

fn parse_args<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> crate::error::GatewayResult<T> {
    serde_json::from_value(value).map_err(|e| bad_argument(format!("invalid arguments: {e}")))
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
