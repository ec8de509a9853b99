//! The `Vfs` contract (`spec.md` §6.1): everything an embedder implements
//! to back the bridge. Deliberately transport-agnostic — no RPC framing,
//! no HTTP, no knowledge of the Handle Registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::capabilities::StreamResource;
use crate::error::VfsResult;
use crate::meta::Meta;

/// Loosely-typed operation options. Every `Vfs` operation accepts one of
/// these rather than a bespoke struct per method, mirroring the
/// source's single untyped `options` bag (§3, §6.1): the set of
/// meaningful keys varies per operation (`parents`, `recursive`,
/// `bufferWrite`, `from`, `target`, `cols`, `rows`, `range`, ...) and a
/// typed struct per call would just be this same map with extra steps.
///
/// `stream` is split out of the scalar map because it is the one option
/// value that is a live resource rather than JSON (an upload body for
/// `mkfile`, a proxy for a remote stream the dispatcher attached per
/// §4.5 rule (b)).
#[derive(Debug, Clone, Default)]
pub struct VfsOptions {
    pub fields: serde_json::Map<String, Value>,
    pub stream: Option<Arc<dyn StreamResource>>,
}

impl VfsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_stream(mut self, stream: Arc<dyn StreamResource>) -> Self {
        self.stream = Some(stream);
        self
    }
}

impl From<serde_json::Map<String, Value>> for VfsOptions {
    fn from(fields: serde_json::Map<String, Value>) -> Self {
        Self { fields, stream: None }
    }
}

/// A sink for VFS-level events (`on`/`off`/`emit`, §4.5), distinct from
/// the per-resource event streams in `capabilities.rs`.
pub type EventSink = tokio::sync::mpsc::UnboundedSender<Value>;

#[async_trait]
pub trait Vfs: Send + Sync {
    async fn resolve(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn stat(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn metadata(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;

    async fn readfile(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn readdir(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;

    async fn mkfile(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn mkdir(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn mkdir_p(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn appendfile(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;

    async fn rmfile(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn rmdir(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;

    async fn rename(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn copy(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn chmod(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn symlink(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;

    async fn watch(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn connect(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;

    async fn spawn(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn killtree(&self, pid: u32, options: VfsOptions) -> VfsResult<Meta>;
    async fn pty(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn tmux(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn exec_file(&self, path: &str, options: VfsOptions) -> VfsResult<Meta>;

    async fn extend(&self, name: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn unextend(&self, name: &str, options: VfsOptions) -> VfsResult<Meta>;
    async fn use_api(&self, name: &str, options: VfsOptions) -> VfsResult<Meta>;

    /// Static environment/capability description surfaced to clients
    /// (§6.1 `env`). No path, no options, no async work.
    fn env(&self) -> Value;

    async fn on(&self, event: &str, sink: EventSink) -> u64;
    async fn off(&self, event: &str, sink_id: u64);
    async fn emit(&self, event: &str, value: Value);
}
