//! The resource capability traits from the "Design Notes" of `spec.md` §9:
//! a small, explicit capability set standing in for the source's untyped
//! event emitters. Concrete VFS backends (see `bridge-server::vfs_local`)
//! implement these; `bridge-core`'s Handle Registry stores them as trait
//! objects and drains their event streams.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::error::VfsResult;

/// Pointer-identity of a resource, used only to make `store_stream` /
/// `store_process` idempotent (§4.1, §9: "a side-table keyed by resource
/// identity, not a mutation of the resource").
pub type ResourceIdentity = usize;

/// Events a stream resource pushes toward the registry once subscribed
/// (§4.1 "Subscriptions on store").
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Data(Bytes),
    End(Option<Bytes>),
    Close,
    Error(String),
}

/// A live stream resource. A given resource may be readable, writable, or
/// both (§3: "A local stream handle additionally tracks `readable`,
/// `writable`").
#[async_trait]
pub trait StreamResource: Send + Sync + fmt::Debug {
    fn identity(&self) -> ResourceIdentity;

    fn readable(&self) -> bool;
    fn writable(&self) -> bool;

    /// Pause the source (remote→local backpressure, §4.4 rule 2).
    fn pause(&self);
    /// Resume the source (on channel `drain`, §4.4 rule 1).
    fn resume(&self);
    /// Remote-initiated teardown (`destroy` RPC method, §4.5).
    fn destroy(&self);

    /// Local→remote write (remote peer writes to our local writable,
    /// §4.5). Returns whether the sink is still accepting writes.
    fn write(&self, chunk: Bytes) -> bool;
    fn end(&self, chunk: Option<Bytes>);

    /// Take the event receiver. Must be callable exactly once; the
    /// registry calls it immediately at `store_stream` time and spawns a
    /// forwarding task (§4.1 "Subscriptions on store").
    fn take_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<StreamEvent>;
}

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    Close {
        code: Option<i32>,
        signal: Option<String>,
    },
}

#[async_trait]
pub trait ProcessResource: Send + Sync + fmt::Debug {
    fn identity(&self) -> ResourceIdentity;
    fn pid(&self) -> u32;

    fn stdin(&self) -> Option<std::sync::Arc<dyn StreamResource>>;
    fn stdout(&self) -> Option<std::sync::Arc<dyn StreamResource>>;
    fn stderr(&self) -> Option<std::sync::Arc<dyn StreamResource>>;

    fn kill(&self, code: Option<i32>);
    fn unref(&self);

    fn take_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<ProcessEvent>;
}

#[derive(Debug, Clone)]
pub enum PtyEvent {
    Stream(StreamEvent),
    Process(ProcessEvent),
    Kill,
}

/// A PTY handle is a process *and* a stream sharing one token (§3).
#[async_trait]
pub trait PtyResource: Send + Sync + fmt::Debug {
    fn identity(&self) -> ResourceIdentity;
    fn pid(&self) -> u32;

    fn readable(&self) -> bool;
    fn writable(&self) -> bool;

    fn write(&self, chunk: Bytes) -> bool;
    fn end(&self, chunk: Option<Bytes>);
    fn pause(&self);
    fn resume(&self);
    fn destroy(&self);
    fn kill(&self, code: Option<i32>);

    /// Swallow failures from the underlying resize call (§4.5: `resize`
    /// "must swallow failures").
    fn resize(&self, cols: u16, rows: u16);

    fn take_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<PtyEvent>;
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub event: String,
    pub filename: Option<String>,
    pub stat: Option<serde_json::Value>,
    pub files: Option<Vec<String>>,
}

#[async_trait]
pub trait WatcherResource: Send + Sync + fmt::Debug {
    fn identity(&self) -> ResourceIdentity;
    fn close(&self);
    fn take_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>;
}

/// An extension API registered via `extend` (§3: "An API handle carries a
/// `name` and a list of callable method `names`").
#[async_trait]
pub trait ApiResource: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn names(&self) -> Vec<String>;
    async fn call(&self, method: &str, args: Vec<serde_json::Value>) -> VfsResult<serde_json::Value>;
}
