//! The RPC Dispatcher (`spec.md` §4.5): the fixed method table routing
//! named RPC calls to the registry, the `Vfs`, and the Callback
//! Marshaller. Transport-agnostic — `bridge-server::ws_transport` is
//! what actually reads JSON frames off a WebSocket and calls into this.

use std::sync::Arc;
use std::time::Instant;

use bridge_contracts::{EventSink, StreamEvent, StreamToken, Vfs, VfsError, VfsOptions};
use bytes::Bytes;
use serde_json::Value;

use crate::marshaller::{CallbackMarshaller, WireMeta};
use crate::registry::HandleRegistry;
use crate::stream_proxy::{RpcPeer, StreamProxy};

/// Every operation listed in §6.1, routed uniformly through
/// `dispatch_vfs`. `killtree` is handled separately since its first
/// argument is a pid, not a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedVfsOp {
    Resolve,
    Stat,
    Metadata,
    Readfile,
    Readdir,
    Mkfile,
    Mkdir,
    MkdirP,
    Appendfile,
    Rmfile,
    Rmdir,
    Rename,
    Copy,
    Chmod,
    Symlink,
    Watch,
    Connect,
    Spawn,
    Pty,
    Tmux,
    ExecFile,
    Extend,
    Unextend,
    UseApi,
}

pub struct RpcDispatcher {
    registry: Arc<HandleRegistry>,
    vfs: Arc<dyn Vfs>,
    marshaller: Arc<CallbackMarshaller>,
    peer: Arc<dyn RpcPeer>,
    started: Instant,
}

impl RpcDispatcher {
    pub fn new(registry: Arc<HandleRegistry>, vfs: Arc<dyn Vfs>, marshaller: Arc<CallbackMarshaller>, peer: Arc<dyn RpcPeer>) -> Self {
        Self { registry, vfs, marshaller, peer, started: Instant::now() }
    }

    /// §4.5 "Routed VFS operations": (b) rewrite an inbound stream token
    /// into a proxy, (c) a null/missing path fails fast with
    /// `EINVALIDPATH`, (d) the result goes through the marshaller.
    pub async fn dispatch_vfs(
        &self,
        op: RoutedVfsOp,
        path: Option<String>,
        mut options: VfsOptions,
        stream_token: Option<StreamToken>,
    ) -> (Option<bridge_contracts::ErrorEnvelope>, Option<WireMeta>) {
        let Some(path) = path else {
            return self.marshaller.deliver(Err(VfsError::InvalidPath));
        };

        if let Some(token) = stream_token {
            let proxy = StreamProxy::new(token, Arc::clone(&self.peer));
            self.registry.register_proxy(Arc::clone(&proxy));
            options.stream = Some(proxy);
        }

        let result = match op {
            RoutedVfsOp::Resolve => self.vfs.resolve(&path, options).await,
            RoutedVfsOp::Stat => self.vfs.stat(&path, options).await,
            RoutedVfsOp::Metadata => self.vfs.metadata(&path, options).await,
            RoutedVfsOp::Readfile => self.vfs.readfile(&path, options).await,
            RoutedVfsOp::Readdir => self.vfs.readdir(&path, options).await,
            RoutedVfsOp::Mkfile => self.vfs.mkfile(&path, options).await,
            RoutedVfsOp::Mkdir => self.vfs.mkdir(&path, options).await,
            RoutedVfsOp::MkdirP => self.vfs.mkdir_p(&path, options).await,
            RoutedVfsOp::Appendfile => self.vfs.appendfile(&path, options).await,
            RoutedVfsOp::Rmfile => self.vfs.rmfile(&path, options).await,
            RoutedVfsOp::Rmdir => self.vfs.rmdir(&path, options).await,
            RoutedVfsOp::Rename => self.vfs.rename(&path, options).await,
            RoutedVfsOp::Copy => self.vfs.copy(&path, options).await,
            RoutedVfsOp::Chmod => self.vfs.chmod(&path, options).await,
            RoutedVfsOp::Symlink => self.vfs.symlink(&path, options).await,
            RoutedVfsOp::Watch => self.vfs.watch(&path, options).await,
            RoutedVfsOp::Connect => self.vfs.connect(&path, options).await,
            RoutedVfsOp::Spawn => self.vfs.spawn(&path, options).await,
            RoutedVfsOp::Pty => self.vfs.pty(&path, options).await,
            RoutedVfsOp::Tmux => self.vfs.tmux(&path, options).await,
            RoutedVfsOp::ExecFile => self.vfs.exec_file(&path, options).await,
            RoutedVfsOp::Extend => self.vfs.extend(&path, options).await,
            RoutedVfsOp::Unextend => self.vfs.unextend(&path, options).await,
            RoutedVfsOp::UseApi => self.vfs.use_api(&path, options).await,
        };

        self.marshaller.deliver(result)
    }

    pub async fn dispatch_killtree(&self, pid: u32, options: VfsOptions) -> (Option<bridge_contracts::ErrorEnvelope>, Option<WireMeta>) {
        self.marshaller.deliver(self.vfs.killtree(pid, options).await)
    }

    // -- Per-stream: remote writes to our local writable (§4.5) --

    pub fn handle_write(&self, id: u32, chunk: Bytes) {
        if let Some(stream) = self.registry.lookup_stream(id) {
            stream.write(chunk);
        }
    }

    pub fn handle_end(&self, id: u32, chunk: Option<Bytes>) {
        if let Some(stream) = self.registry.lookup_stream(id) {
            stream.end(chunk);
        }
    }

    // -- Per-stream: remote controls our local readable (§4.5) --

    pub fn handle_destroy(&self, id: u32) {
        if let Some(stream) = self.registry.lookup_stream(id) {
            stream.destroy();
        }
    }

    pub fn handle_resume(&self, id: u32) {
        if let Some(stream) = self.registry.lookup_stream(id) {
            stream.resume();
        }
    }

    pub fn handle_pause(&self, id: u32) {
        if let Some(stream) = self.registry.lookup_stream(id) {
            stream.pause();
        }
    }

    // -- Per-stream: peer is our proxy target (§4.5) --

    /// Returns whether we're still accepting data for this proxy; the
    /// transport sends this back as the `onData` call's reply so the
    /// remote can pause its source (§4.4 rule 2). This reference
    /// dispatcher always accepts.
    pub fn handle_on_data(&self, id: u32, chunk: Bytes) -> bool {
        if let Some(proxy) = self.registry.lookup_proxy(id) {
            proxy.deliver(StreamEvent::Data(chunk));
        }
        true
    }

    pub fn handle_on_end(&self, id: u32, chunk: Option<Bytes>) {
        if let Some(proxy) = self.registry.lookup_proxy(id) {
            proxy.deliver(StreamEvent::End(chunk));
        }
        self.registry.remove_proxy(id);
    }

    pub fn handle_on_close(&self, id: u32) {
        if let Some(proxy) = self.registry.lookup_proxy(id) {
            proxy.deliver(StreamEvent::Close);
        }
        self.registry.remove_proxy(id);
    }

    pub fn handle_on_error(&self, id: u32, message: String) {
        if let Some(proxy) = self.registry.lookup_proxy(id) {
            proxy.deliver(StreamEvent::Error(message));
        }
    }

    // -- Per-process --

    pub fn handle_kill(&self, pid: u32, code: Option<i32>) {
        if let Some(process) = self.registry.lookup_process(pid) {
            process.kill(code);
        }
    }

    pub fn handle_unref(&self, pid: u32) {
        self.registry.unref_process(pid);
    }

    // -- Per-PTY --

    /// "must swallow failures from the underlying resize call" (§4.5).
    pub fn handle_resize(&self, pid: u32, cols: u16, rows: u16) {
        if let Some(pty) = self.registry.lookup_pty(pid) {
            pty.resize(cols, rows);
        }
    }

    // -- Per-watcher --

    pub fn handle_watcher_close(&self, id: u32) {
        if let Some(watcher) = self.registry.lookup_watcher(id) {
            watcher.close();
        }
    }

    // -- Per-API --

    pub async fn handle_api_call(&self, name: &str, method: &str, args: Vec<Value>) -> (Option<bridge_contracts::ErrorEnvelope>, Option<Value>) {
        let Some(api) = self.registry.lookup_api(name) else {
            return (Some(self.marshaller.marshal_error(&VfsError::NotFound(format!("no such api: {name}")))), None);
        };
        match api.call(method, args).await {
            Ok(value) => (None, Some(value)),
            Err(err) => (Some(self.marshaller.marshal_error(&err)), None),
        }
    }

    // -- Events --

    pub async fn handle_subscribe(&self, name: &str, sink: EventSink) -> u64 {
        self.vfs.on(name, sink).await
    }

    pub async fn handle_unsubscribe(&self, name: &str, sink_id: u64) {
        self.vfs.off(name, sink_id).await
    }

    pub async fn handle_emit(&self, name: &str, value: Value) {
        self.vfs.emit(name, value).await
    }

    // -- Channel-level --

    pub fn on_channel_drain(&self) {
        self.registry.on_channel_drain();
    }

    /// `ping(["serverTime", cb])` (§4.5, S7): elapsed time since this
    /// dispatcher (i.e. this connection) was created.
    pub async fn ping(&self) -> Value {
        serde_json::json!({ "serverTime": self.started.elapsed().as_millis() as u64 })
    }
}
