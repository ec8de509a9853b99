//! The WebSocket transport (`spec.md` §4.5/§6.3): reads JSON frames off
//! a socket, routes them through `bridge_core::RpcDispatcher`, and
//! turns registry/dispatcher callbacks back into outbound frames.
//! Mirrors `ferrex-server::handlers::handle_websocket` for the
//! split-socket, channel-forwarding shape; the frame protocol itself
//! (one JSON object per `Message::Text`, binary chunks carried as
//! base64 `chunk` fields) is this crate's own design, since `spec.md`
//! leaves wire framing to "the wire codec ... assumed" (§1).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::Engine;
use bridge_contracts::{ChangeEvent, ErrorEnvelope, StreamToken, Vfs, VfsOptions};
use bridge_core::{CallbackMarshaller, FlowController, HandleRegistry, PeerEvents, RoutedVfsOp, RpcDispatcher, RpcPeer};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const OUTBOUND_CAPACITY: usize = 256;

/// Count of currently-open RPC sockets, surfaced by `/healthz`. Each
/// socket owns its own `HandleRegistry`, so this is the closest
/// process-wide "how much is live" signal without sharing registries
/// across unrelated peers.
static OPEN_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

pub fn open_connections() -> usize {
    OPEN_CONNECTIONS.load(Ordering::Relaxed)
}

#[derive(Clone)]
pub struct WsState {
    pub vfs: Arc<dyn Vfs>,
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.vfs))
}

fn base64_decode(text: &str) -> Option<Bytes> {
    base64::engine::general_purpose::STANDARD.decode(text).ok().map(Bytes::from)
}

fn base64_encode(chunk: &Bytes) -> String {
    base64::engine::general_purpose::STANDARD.encode(chunk)
}

/// The remote peer on the other end of this socket, playing both
/// `PeerEvents` (registry → outbound event frames) and `RpcPeer`
/// (`StreamProxy` → outbound per-stream control frames) roles, since
/// both ultimately just write JSON to the same channel.
struct WsPeer {
    outbound: mpsc::Sender<Message>,
}

impl WsPeer {
    fn send(&self, value: Value) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let _ = outbound.send(Message::Text(value.to_string().into())).await;
        });
    }
}

#[async_trait]
impl PeerEvents for WsPeer {
    async fn on_data(&self, id: u32, chunk: Bytes) -> bool {
        let frame = json!({"event": "onData", "id": id, "chunk": base64_encode(&chunk)});
        match self.outbound.try_send(Message::Text(frame.to_string().into())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn on_end(&self, id: u32, chunk: Option<Bytes>) {
        self.send(json!({"event": "onEnd", "id": id, "chunk": chunk.as_ref().map(base64_encode)}));
    }

    async fn on_close(&self, id: u32) {
        self.send(json!({"event": "onClose", "id": id}));
    }

    async fn on_error(&self, id: u32, message: String) {
        self.send(json!({"event": "onError", "id": id, "error": message}));
    }

    async fn on_exit(&self, pid: u32, code: Option<i32>, signal: Option<String>) {
        self.send(json!({"event": "onExit", "pid": pid, "code": code, "signal": signal}));
    }

    async fn on_process_close(&self, pid: u32, code: Option<i32>, signal: Option<String>) {
        self.send(json!({"event": "onProcessClose", "pid": pid, "code": code, "signal": signal}));
    }

    async fn on_pty_kill(&self, pid: u32) {
        self.send(json!({"event": "onPtyKill", "pid": pid}));
    }

    async fn on_change(&self, id: u32, event: ChangeEvent) {
        self.send(json!({
            "event": "onChange",
            "id": id,
            "name": event.event,
            "filename": event.filename,
            "stat": event.stat,
            "files": event.files,
        }));
    }
}

#[async_trait]
impl RpcPeer for WsPeer {
    async fn remote_write(&self, id: u32, chunk: Bytes) {
        self.send(json!({"method": "write", "id": id, "chunk": base64_encode(&chunk)}));
    }

    async fn remote_end(&self, id: u32, chunk: Option<Bytes>) {
        self.send(json!({"method": "end", "id": id, "chunk": chunk.as_ref().map(base64_encode)}));
    }

    async fn remote_destroy(&self, id: u32) {
        self.send(json!({"method": "destroy", "id": id}));
    }

    async fn remote_pause(&self, id: u32) {
        self.send(json!({"method": "pause", "id": id}));
    }

    async fn remote_resume(&self, id: u32) {
        self.send(json!({"method": "resume", "id": id}));
    }
}

fn routed_op(method: &str) -> Option<RoutedVfsOp> {
    Some(match method {
        "resolve" => RoutedVfsOp::Resolve,
        "stat" => RoutedVfsOp::Stat,
        "metadata" => RoutedVfsOp::Metadata,
        "readfile" => RoutedVfsOp::Readfile,
        "readdir" => RoutedVfsOp::Readdir,
        "mkfile" => RoutedVfsOp::Mkfile,
        "mkdir" => RoutedVfsOp::Mkdir,
        "mkdirP" => RoutedVfsOp::MkdirP,
        "appendfile" => RoutedVfsOp::Appendfile,
        "rmfile" => RoutedVfsOp::Rmfile,
        "rmdir" => RoutedVfsOp::Rmdir,
        "rename" => RoutedVfsOp::Rename,
        "copy" => RoutedVfsOp::Copy,
        "chmod" => RoutedVfsOp::Chmod,
        "symlink" => RoutedVfsOp::Symlink,
        "watch" => RoutedVfsOp::Watch,
        "connect" => RoutedVfsOp::Connect,
        "spawn" => RoutedVfsOp::Spawn,
        "pty" => RoutedVfsOp::Pty,
        "tmux" => RoutedVfsOp::Tmux,
        "execFile" => RoutedVfsOp::ExecFile,
        "extend" => RoutedVfsOp::Extend,
        "unextend" => RoutedVfsOp::Unextend,
        "use" => RoutedVfsOp::UseApi,
        _ => return None,
    })
}

async fn handle_socket(socket: WebSocket, vfs: Arc<dyn Vfs>) {
    OPEN_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

    let registry = Arc::new(HandleRegistry::new());
    let peer: Arc<WsPeer> = Arc::new(WsPeer { outbound: outbound_tx.clone() });
    let marshaller = Arc::new(CallbackMarshaller::new(Arc::clone(&registry), Arc::clone(&peer) as Arc<dyn PeerEvents>));
    let dispatcher = Arc::new(RpcDispatcher::new(Arc::clone(&registry), vfs, marshaller, Arc::clone(&peer) as Arc<dyn RpcPeer>));
    let flow_controller = FlowController::new(Arc::clone(&registry));
    let capacity_probe = outbound_tx.clone();

    let sender_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
            if capacity_probe.capacity() == OUTBOUND_CAPACITY {
                flow_controller.on_channel_drain();
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&dispatcher, &outbound_tx, text.as_str()).await,
            Ok(Message::Binary(_)) => debug!("unexpected binary frame, ignoring"),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(error = %err, "websocket read error");
                break;
            }
        }
    }

    registry.teardown();
    drop(outbound_tx);
    let _ = sender_task.await;
    OPEN_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

fn reply(outbound: &mpsc::Sender<Message>, value: Value) {
    let outbound = outbound.clone();
    tokio::spawn(async move {
        let _ = outbound.send(Message::Text(value.to_string().into())).await;
    });
}

fn error_json(error: Option<&ErrorEnvelope>) -> Value {
    match error {
        Some(envelope) => json!({"stack": envelope.message, "code": envelope.code, "message": envelope.message}),
        None => Value::Null,
    }
}

async fn handle_frame(dispatcher: &Arc<RpcDispatcher>, outbound: &mpsc::Sender<Message>, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "malformed rpc frame, ignoring");
            return;
        }
    };

    let Some(method) = frame.get("method").and_then(Value::as_str) else {
        debug!("rpc frame missing method, ignoring");
        return;
    };
    let call_id = frame.get("callId").and_then(Value::as_u64);
    let id = frame.get("id").and_then(Value::as_u64).map(|v| v as u32);
    let pid = frame.get("pid").and_then(Value::as_u64).map(|v| v as u32);
    let chunk = frame.get("chunk").and_then(Value::as_str).and_then(base64_decode);

    if let Some(op) = routed_op(method) {
        let Some(call_id) = call_id else {
            warn!(method, "routed vfs call missing callId, refusing");
            return;
        };
        let path = frame.get("path").and_then(Value::as_str).map(str::to_string);
        let options: VfsOptions = frame.get("options").and_then(Value::as_object).cloned().unwrap_or_default().into();
        let stream_token: Option<StreamToken> = frame.get("stream").and_then(|v| serde_json::from_value(v.clone()).ok());
        let (error, meta) = dispatcher.dispatch_vfs(op, path, options, stream_token).await;
        reply(outbound, json!({"callId": call_id, "error": error_json(error.as_ref()), "meta": meta}));
        return;
    }

    match method {
        "killtree" => {
            let (Some(call_id), Some(pid)) = (call_id, pid) else { return };
            let options: VfsOptions = frame.get("options").and_then(Value::as_object).cloned().unwrap_or_default().into();
            let (error, meta) = dispatcher.dispatch_killtree(pid, options).await;
            reply(outbound, json!({"callId": call_id, "error": error_json(error.as_ref()), "meta": meta}));
        }
        "write" => {
            if let (Some(id), Some(chunk)) = (id, chunk) {
                dispatcher.handle_write(id, chunk);
            }
        }
        "end" => {
            if let Some(id) = id {
                dispatcher.handle_end(id, chunk);
            }
        }
        "destroy" => {
            if let Some(id) = id {
                dispatcher.handle_destroy(id);
            }
        }
        "resume" => {
            if let Some(id) = id {
                dispatcher.handle_resume(id);
            }
        }
        "pause" => {
            if let Some(id) = id {
                dispatcher.handle_pause(id);
            }
        }
        "onData" => {
            if let (Some(call_id), Some(id), Some(chunk)) = (call_id, id, chunk) {
                let accepted = dispatcher.handle_on_data(id, chunk);
                reply(outbound, json!({"callId": call_id, "result": accepted}));
            }
        }
        "onEnd" => {
            if let Some(id) = id {
                dispatcher.handle_on_end(id, chunk);
            }
        }
        "onClose" => {
            if let Some(id) = id {
                dispatcher.handle_on_close(id);
            }
        }
        "onError" => {
            if let Some(id) = id {
                let message = frame.get("error").and_then(Value::as_str).unwrap_or("").to_string();
                dispatcher.handle_on_error(id, message);
            }
        }
        "kill" => {
            if let Some(pid) = pid {
                let code = frame.get("code").and_then(Value::as_i64).map(|v| v as i32);
                dispatcher.handle_kill(pid, code);
            }
        }
        "unref" => {
            if let Some(pid) = pid {
                dispatcher.handle_unref(pid);
            }
        }
        "resize" => {
            if let Some(pid) = pid {
                let cols = frame.get("cols").and_then(Value::as_u64).unwrap_or(80) as u16;
                let rows = frame.get("rows").and_then(Value::as_u64).unwrap_or(24) as u16;
                dispatcher.handle_resize(pid, cols, rows);
            }
        }
        "close" => {
            if let Some(id) = id {
                dispatcher.handle_watcher_close(id);
            }
        }
        "call" => {
            let Some(call_id) = call_id else { return };
            let name = frame.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let fn_name = frame.get("fnName").and_then(Value::as_str).unwrap_or_default().to_string();
            let args: Vec<Value> = frame.get("args").and_then(Value::as_array).cloned().unwrap_or_default();
            let (error, result) = dispatcher.handle_api_call(&name, &fn_name, args).await;
            reply(outbound, json!({"callId": call_id, "error": error_json(error.as_ref()), "result": result}));
        }
        "subscribe" => {
            let Some(call_id) = call_id else { return };
            let name = frame.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Value>();
            let sink_id = dispatcher.handle_subscribe(&name, sink_tx).await;
            let event_outbound = outbound.clone();
            let event_name = name.clone();
            tokio::spawn(async move {
                while let Some(payload) = sink_rx.recv().await {
                    let frame = json!({"event": "onEvent", "name": event_name, "value": payload});
                    if event_outbound.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
            });
            reply(outbound, json!({"callId": call_id, "result": sink_id}));
        }
        "unsubscribe" => {
            let name = frame.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            if let Some(sink_id) = frame.get("sinkId").and_then(Value::as_u64) {
                dispatcher.handle_unsubscribe(&name, sink_id).await;
            }
        }
        "emit" => {
            let name = frame.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let value = frame.get("value").cloned().unwrap_or(Value::Null);
            dispatcher.handle_emit(&name, value).await;
        }
        "ping" => {
            if let Some(call_id) = call_id {
                let result = dispatcher.ping().await;
                reply(outbound, json!({"callId": call_id, "result": result}));
            }
        }
        _ => {
            debug!(method, "unknown rpc method, ignoring");
        }
    }
}
