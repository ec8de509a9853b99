//! The Stream Proxy (`spec.md` §4.2): a local stand-in for a stream the
//! *peer* holds. Reads/writes forward over the RPC channel; the events
//! a real local stream would emit are instead delivered whenever the
//! peer calls `onData`/`onEnd`/`onClose`/`onError` on us.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bridge_contracts::{ResourceIdentity, StreamEvent, StreamResource, StreamToken};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

static NEXT_IDENTITY: AtomicUsize = AtomicUsize::new(1);

/// Outbound calls a proxy makes toward the peer that owns the real
/// stream. `bridge-server`'s transport implements this over the RPC
/// channel.
#[async_trait]
pub trait RpcPeer: Send + Sync {
    async fn remote_write(&self, id: u32, chunk: Bytes);
    async fn remote_end(&self, id: u32, chunk: Option<Bytes>);
    async fn remote_destroy(&self, id: u32);
    async fn remote_pause(&self, id: u32);
    async fn remote_resume(&self, id: u32);
}

#[derive(Debug)]
pub struct StreamProxy {
    token: StreamToken,
    peer: Arc<dyn RpcPeer>,
    identity: ResourceIdentity,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl std::fmt::Debug for dyn RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RpcPeer")
    }
}

impl StreamProxy {
    pub fn new(token: StreamToken, peer: Arc<dyn RpcPeer>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            token,
            peer,
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn token(&self) -> &StreamToken {
        &self.token
    }

    /// Called by the dispatcher's `onData`/`onEnd`/`onClose`/`onError`
    /// handlers (§4.5 "Per-stream: peer is our proxy target") to deliver
    /// an event toward the local consumer.
    pub fn deliver(&self, event: StreamEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl StreamResource for StreamProxy {
    fn identity(&self) -> ResourceIdentity {
        self.identity
    }

    fn readable(&self) -> bool {
        self.token.readable.unwrap_or(false)
    }

    fn writable(&self) -> bool {
        self.token.writable.unwrap_or(false)
    }

    fn pause(&self) {
        let peer = Arc::clone(&self.peer);
        let id = self.token.id;
        tokio::spawn(async move { peer.remote_pause(id).await });
    }

    fn resume(&self) {
        let peer = Arc::clone(&self.peer);
        let id = self.token.id;
        tokio::spawn(async move { peer.remote_resume(id).await });
    }

    fn destroy(&self) {
        let peer = Arc::clone(&self.peer);
        let id = self.token.id;
        tokio::spawn(async move { peer.remote_destroy(id).await });
    }

    fn write(&self, chunk: Bytes) -> bool {
        let peer = Arc::clone(&self.peer);
        let id = self.token.id;
        tokio::spawn(async move { peer.remote_write(id, chunk).await });
        true
    }

    fn end(&self, chunk: Option<Bytes>) {
        let peer = Arc::clone(&self.peer);
        let id = self.token.id;
        tokio::spawn(async move { peer.remote_end(id, chunk).await });
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.events_rx
            .lock()
            .take()
            .expect("StreamProxy::take_events called more than once")
    }
}
