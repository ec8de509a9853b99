//! `Meta`: the result projection every `Vfs` operation returns (`spec.md`
//! §3). It carries at most one live resource plus the scalar hints the
//! HTTP Gateway and RPC Dispatcher read to decide status codes, headers
//! and framing.

use std::sync::Arc;

use crate::capabilities::{ApiResource, PtyResource, ProcessResource, StreamResource, WatcherResource};

/// The half-open byte range of a `206 Partial Content` response.
#[derive(Debug, Clone, Copy)]
pub struct PartialContent {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct Meta {
    pub stream: Option<Arc<dyn StreamResource>>,
    pub process: Option<Arc<dyn ProcessResource>>,
    pub pty: Option<Arc<dyn PtyResource>>,
    pub watcher: Option<Arc<dyn WatcherResource>>,
    pub api: Option<Arc<dyn ApiResource>>,

    /// `resolve`/`stat` conditional-request hints (§4.6, §6.1).
    pub etag: Option<String>,
    pub not_modified: Option<bool>,
    pub partial_content: Option<PartialContent>,
    /// Response body text when a `Range` request cannot be satisfied
    /// (§4.6: "416 body comes from `meta.rangeNotSatisfiable`").
    pub range_not_satisfiable: Option<String>,

    pub mime: Option<String>,
    pub size: Option<u64>,
    pub metadata_size: Option<u64>,
    pub metadata_string_length: Option<usize>,

    /// Set by `stat`/`resolve` when the caller only needs headers
    /// (`HEAD`, §4.6).
    pub head: Option<bool>,

    /// Anything an operation returns that doesn't have a first-class
    /// field above (directory listings, rename/copy results, `api`
    /// invocation results, ...). The Callback Marshaller and HTTP
    /// Gateway both serialize this verbatim.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_stream(mut self, stream: Arc<dyn StreamResource>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_process(mut self, process: Arc<dyn ProcessResource>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn with_pty(mut self, pty: Arc<dyn PtyResource>) -> Self {
        self.pty = Some(pty);
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn WatcherResource>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn with_api(mut self, api: Arc<dyn ApiResource>) -> Self {
        self.api = Some(api);
        self
    }
}
