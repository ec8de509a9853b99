//! The Handle Registry (`spec.md` §4.1): allocates ids, stores live
//! resources, subscribes to their event streams on `store`, and tears
//! everything down deterministically on disconnect.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_contracts::{
    ApiResource, ApiToken, ChangeEvent, ProcessEvent, ProcessResource, ProcessToken, PtyEvent, PtyResource, PtyToken,
    ResourceIdentity, StreamEvent, StreamResource, StreamToken, Token, WatcherResource, WatcherToken,
};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::id_alloc::RollingIdAllocator;
use crate::stream_proxy::StreamProxy;

/// Peer-facing callbacks the registry drives as resource events arrive.
/// `bridge-server`'s transport forwards these to outbound RPC frames
/// (`onData`, `onEnd`, ... — §6.3).
#[async_trait]
pub trait PeerEvents: Send + Sync {
    async fn on_data(&self, id: u32, chunk: Bytes) -> bool;
    async fn on_end(&self, id: u32, chunk: Option<Bytes>);
    async fn on_close(&self, id: u32);
    async fn on_error(&self, id: u32, message: String);
    async fn on_exit(&self, pid: u32, code: Option<i32>, signal: Option<String>);
    async fn on_process_close(&self, pid: u32, code: Option<i32>, signal: Option<String>);
    async fn on_pty_kill(&self, pid: u32);
    async fn on_change(&self, id: u32, event: ChangeEvent);
}

struct StreamEntry {
    token: StreamToken,
    resource: Arc<dyn StreamResource>,
    identity: ResourceIdentity,
}

struct ProcessEntry {
    token: ProcessToken,
    resource: Arc<dyn ProcessResource>,
    identity: ResourceIdentity,
    unreffed: std::sync::atomic::AtomicBool,
}

struct PtyEntry {
    token: PtyToken,
    resource: Arc<dyn PtyResource>,
}

struct WatcherEntry {
    resource: Arc<dyn WatcherResource>,
}

struct ApiEntry {
    resource: Arc<dyn ApiResource>,
}

/// Per-connection. Never shared across connections (`spec.md` §5 "Shared
/// resources").
pub struct HandleRegistry {
    streams: DashMap<u32, StreamEntry>,
    stream_ids: Mutex<RollingIdAllocator>,
    stream_identity: DashMap<ResourceIdentity, u32>,

    processes: DashMap<u32, ProcessEntry>,
    process_identity: DashMap<ResourceIdentity, u32>,

    ptys: DashMap<u32, PtyEntry>,
    pty_ids: Mutex<RollingIdAllocator>,

    watchers: DashMap<u32, WatcherEntry>,
    watcher_ids: Mutex<RollingIdAllocator>,

    apis: DashMap<String, ApiEntry>,

    /// Proxies created for inbound `options.stream` tokens (§4.5 rule
    /// b), keyed by the *peer's* id for that stream — a distinct id
    /// space from `streams`, since the peer minted it. Removed on the
    /// first of `onEnd`/`onClose` (§4.2).
    proxies: DashMap<u32, Arc<StreamProxy>>,

    /// Fired on channel `drain` for proxy writable streams waiting on
    /// backpressure to clear (§4.4 rule 1).
    drain: tokio::sync::Notify,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn stream_id_of(token: &Option<Box<Token>>) -> Option<u32> {
    match token.as_deref() {
        Some(Token::Stream(s)) => Some(s.id),
        _ => None,
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            stream_ids: Mutex::new(RollingIdAllocator::new()),
            stream_identity: DashMap::new(),
            processes: DashMap::new(),
            process_identity: DashMap::new(),
            ptys: DashMap::new(),
            pty_ids: Mutex::new(RollingIdAllocator::new()),
            watchers: DashMap::new(),
            watcher_ids: Mutex::new(RollingIdAllocator::new()),
            apis: DashMap::new(),
            proxies: DashMap::new(),
            drain: tokio::sync::Notify::new(),
        }
    }

    pub fn register_proxy(&self, proxy: Arc<StreamProxy>) {
        self.proxies.insert(proxy.token().id, proxy);
    }

    pub fn lookup_proxy(&self, id: u32) -> Option<Arc<StreamProxy>> {
        self.proxies.get(&id).map(|e| Arc::clone(&e))
    }

    /// §4.2: "Proxy is removed from the registry on the first of
    /// `onEnd` or `onClose`."
    pub fn remove_proxy(&self, id: u32) {
        self.proxies.remove(&id);
    }

    /// §4.4 rule 1: resume every local readable stream/pty, then wake
    /// proxy writable streams blocked on backpressure.
    pub fn on_channel_drain(&self) {
        for entry in self.streams.iter() {
            if entry.token.readable == Some(true) {
                entry.resource.resume();
            }
        }
        for entry in self.ptys.iter() {
            if entry.token.readable == Some(true) {
                entry.resource.resume();
            }
        }
        self.drain.notify_waiters();
    }

    /// Proxy writable streams that saw a write rejected can await this
    /// to know when to resume sending.
    pub fn drain_signal(&self) -> &tokio::sync::Notify {
        &self.drain
    }

    fn remove_stream(&self, id: u32) {
        if let Some((_, entry)) = self.streams.remove(&id) {
            self.stream_identity.remove(&entry.identity);
            self.stream_ids.lock().release(id);
        }
    }

    fn remove_process(&self, pid: u32) {
        if let Some((_, entry)) = self.processes.remove(&pid) {
            self.process_identity.remove(&entry.identity);
        }
    }

    fn remove_pty(&self, pid: u32) {
        if let Some((_, entry)) = self.ptys.remove(&pid) {
            self.pty_ids.lock().release(entry.token.id);
        }
    }

    fn remove_watcher(&self, id: u32) {
        if self.watchers.remove(&id).is_some() {
            self.watcher_ids.lock().release(id);
        }
    }

    /// §4.1 "Idempotence": returns the previously-minted token if this
    /// exact resource is already registered.
    pub fn store_stream(self: &Arc<Self>, resource: Arc<dyn StreamResource>, peer: Arc<dyn PeerEvents>) -> StreamToken {
        let identity = resource.identity();
        if let Some(existing) = self.stream_identity.get(&identity).map(|r| *r)
            && let Some(entry) = self.streams.get(&existing)
        {
            return entry.token.clone();
        }

        let id = self.stream_ids.lock().allocate();
        let token = StreamToken {
            id,
            readable: resource.readable().then_some(true),
            writable: resource.writable().then_some(true),
        };

        let mut events = resource.take_events();
        self.streams.insert(
            id,
            StreamEntry {
                token: token.clone(),
                resource: Arc::clone(&resource),
                identity,
            },
        );
        self.stream_identity.insert(identity, id);

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Data(chunk) => {
                        if !peer.on_data(id, chunk).await {
                            resource.pause();
                        }
                    }
                    StreamEvent::End(chunk) => {
                        registry.remove_stream(id);
                        peer.on_end(id, chunk).await;
                    }
                    StreamEvent::Close => {
                        registry.remove_stream(id);
                        peer.on_close(id).await;
                        break;
                    }
                    StreamEvent::Error(message) => {
                        peer.on_error(id, message).await;
                    }
                }
            }
        });

        token
    }

    pub fn store_process(self: &Arc<Self>, resource: Arc<dyn ProcessResource>, peer: Arc<dyn PeerEvents>) -> ProcessToken {
        let identity = resource.identity();
        if let Some(existing) = self.process_identity.get(&identity).map(|r| *r)
            && let Some(entry) = self.processes.get(&existing)
        {
            return entry.token.clone();
        }

        let pid = resource.pid();
        let stdin = resource
            .stdin()
            .map(|s| Box::new(Token::Stream(self.store_stream(s, Arc::clone(&peer)))));
        let stdout = resource
            .stdout()
            .map(|s| Box::new(Token::Stream(self.store_stream(s, Arc::clone(&peer)))));
        let stderr = resource
            .stderr()
            .map(|s| Box::new(Token::Stream(self.store_stream(s, Arc::clone(&peer)))));
        let token = ProcessToken { pid, stdin, stdout, stderr };

        let mut events = resource.take_events();
        self.processes.insert(
            pid,
            ProcessEntry {
                token: token.clone(),
                resource,
                identity,
                unreffed: std::sync::atomic::AtomicBool::new(false),
            },
        );
        self.process_identity.insert(identity, pid);

        let registry = Arc::clone(self);
        let token_for_task = token.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Exit { code, signal } => {
                        registry.remove_process(pid);
                        peer.on_exit(pid, code, signal).await;
                    }
                    ProcessEvent::Close { code, signal } => {
                        registry.remove_process(pid);
                        if let Some(id) = stream_id_of(&token_for_task.stdin) {
                            registry.remove_stream(id);
                        }
                        if let Some(id) = stream_id_of(&token_for_task.stdout) {
                            registry.remove_stream(id);
                        }
                        if let Some(id) = stream_id_of(&token_for_task.stderr) {
                            registry.remove_stream(id);
                        }
                        peer.on_process_close(pid, code, signal).await;
                        break;
                    }
                }
            }
        });

        token
    }

    pub fn store_pty(self: &Arc<Self>, resource: Arc<dyn PtyResource>, peer: Arc<dyn PeerEvents>) -> PtyToken {
        let pid = resource.pid();
        let id = self.pty_ids.lock().allocate();
        let token = PtyToken {
            pid,
            id,
            readable: resource.readable().then_some(true),
            writable: resource.writable().then_some(true),
        };

        let mut events = resource.take_events();
        self.ptys.insert(pid, PtyEntry { token: token.clone(), resource: Arc::clone(&resource) });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Stream(StreamEvent::Data(chunk)) => {
                        if !peer.on_data(id, chunk).await {
                            resource.pause();
                        }
                    }
                    PtyEvent::Stream(StreamEvent::End(chunk)) => {
                        peer.on_end(id, chunk).await;
                    }
                    PtyEvent::Stream(StreamEvent::Close) => {
                        registry.remove_pty(pid);
                        peer.on_close(id).await;
                    }
                    PtyEvent::Stream(StreamEvent::Error(message)) => {
                        peer.on_error(id, message).await;
                    }
                    PtyEvent::Process(ProcessEvent::Exit { code, signal }) => {
                        peer.on_exit(pid, code, signal).await;
                    }
                    PtyEvent::Process(ProcessEvent::Close { code, signal }) => {
                        registry.remove_pty(pid);
                        peer.on_process_close(pid, code, signal).await;
                        break;
                    }
                    PtyEvent::Kill => {
                        peer.on_pty_kill(pid).await;
                    }
                }
            }
        });

        token
    }

    pub fn store_watcher(self: &Arc<Self>, resource: Arc<dyn WatcherResource>, peer: Arc<dyn PeerEvents>) -> WatcherToken {
        let id = self.watcher_ids.lock().allocate();
        let mut events = resource.take_events();
        self.watchers.insert(id, WatcherEntry { resource });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                peer.on_change(id, event).await;
            }
            registry.remove_watcher(id);
        });

        WatcherToken { id }
    }

    pub fn store_api(&self, resource: Arc<dyn ApiResource>) -> ApiToken {
        let name = resource.name().to_string();
        let names = resource.names();
        self.apis.insert(name.clone(), ApiEntry { resource });
        ApiToken { name, names }
    }

    pub fn lookup_stream(&self, id: u32) -> Option<Arc<dyn StreamResource>> {
        self.streams.get(&id).map(|e| Arc::clone(&e.resource))
    }

    pub fn lookup_process(&self, pid: u32) -> Option<Arc<dyn ProcessResource>> {
        self.processes.get(&pid).map(|e| Arc::clone(&e.resource))
    }

    pub fn lookup_pty(&self, pid: u32) -> Option<Arc<dyn PtyResource>> {
        self.ptys.get(&pid).map(|e| Arc::clone(&e.resource))
    }

    pub fn lookup_watcher(&self, id: u32) -> Option<Arc<dyn WatcherResource>> {
        self.watchers.get(&id).map(|e| Arc::clone(&e.resource))
    }

    pub fn lookup_api(&self, name: &str) -> Option<Arc<dyn ApiResource>> {
        self.apis.get(name).map(|e| Arc::clone(&e.resource))
    }

    /// `unref(pid)` (§4.5): the process will not be killed by teardown.
    pub fn unref_process(&self, pid: u32) {
        if let Some(entry) = self.processes.get(&pid) {
            entry.unreffed.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// True once every bucket is empty (§8 invariant 1, used by tests).
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
            && self.processes.is_empty()
            && self.ptys.is_empty()
            && self.watchers.is_empty()
            && self.apis.is_empty()
    }

    /// §4.1 "Teardown on disconnect": kill live processes first, then
    /// destroy streams/ptys, then close watchers. APIs are dropped
    /// silently. Idempotent: calling this twice is a no-op the second
    /// time.
    pub fn teardown(&self) {
        let pids: Vec<u32> = self.processes.iter().map(|e| *e.key()).collect();
        for pid in pids {
            if let Some((_, entry)) = self.processes.remove(&pid) {
                self.process_identity.remove(&entry.identity);
                if !entry.unreffed.load(std::sync::atomic::Ordering::Relaxed) {
                    entry.resource.kill(None);
                }
            }
        }

        let stream_ids: Vec<u32> = self.streams.iter().map(|e| *e.key()).collect();
        for id in stream_ids {
            if let Some((_, entry)) = self.streams.remove(&id) {
                self.stream_identity.remove(&entry.identity);
                entry.resource.destroy();
            }
        }
        let pty_pids: Vec<u32> = self.ptys.iter().map(|e| *e.key()).collect();
        for pid in pty_pids {
            if let Some((_, entry)) = self.ptys.remove(&pid) {
                entry.resource.destroy();
            }
        }

        let proxy_ids: Vec<u32> = self.proxies.iter().map(|e| *e.key()).collect();
        for id in proxy_ids {
            if let Some((_, proxy)) = self.proxies.remove(&id) {
                proxy.deliver(StreamEvent::Close);
            }
        }

        let watcher_ids: Vec<u32> = self.watchers.iter().map(|e| *e.key()).collect();
        for id in watcher_ids {
            if let Some((_, entry)) = self.watchers.remove(&id) {
                entry.resource.close();
            }
        }

        self.apis.clear();
    }
}
