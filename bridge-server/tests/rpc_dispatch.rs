//! RPC-side scenarios and invariants from `spec.md` §8 (S6, S7, plus the
//! numbered invariants not already covered by `bridge-core`'s own inline
//! tests), exercised directly against `HandleRegistry`/`RpcDispatcher`
//! with a recording `PeerEvents`/`RpcPeer` double — no wire framing, since
//! the dispatch logic under test never touches it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_contracts::{ResourceIdentity, StreamEvent, StreamResource, Token, Vfs, VfsOptions};
use bridge_core::{CallbackMarshaller, HandleRegistry, PeerEvents, RoutedVfsOp, RpcDispatcher, RpcPeer};
use bridge_server::LocalVfs;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

/// Records every callback the registry/dispatcher drives, and lets a
/// test force `on_data` to reject a chunk to observe backpressure.
struct RecordingPeer {
    data: Mutex<Vec<(u32, Bytes)>>,
    ends: Mutex<Vec<u32>>,
    closed: Notify,
    reject_next_data: AtomicBool,
}

impl RecordingPeer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
            closed: Notify::new(),
            reject_next_data: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PeerEvents for RecordingPeer {
    async fn on_data(&self, id: u32, chunk: Bytes) -> bool {
        self.data.lock().push((id, chunk));
        !self.reject_next_data.swap(false, Ordering::SeqCst)
    }
    async fn on_end(&self, id: u32, _chunk: Option<Bytes>) {
        self.ends.lock().push(id);
    }
    async fn on_close(&self, _id: u32) {
        self.closed.notify_waiters();
    }
    async fn on_error(&self, _id: u32, _message: String) {}
    async fn on_exit(&self, _pid: u32, _code: Option<i32>, _signal: Option<String>) {}
    async fn on_process_close(&self, _pid: u32, _code: Option<i32>, _signal: Option<String>) {}
    async fn on_pty_kill(&self, _pid: u32) {}
    async fn on_change(&self, _id: u32, _event: bridge_contracts::ChangeEvent) {}
}

#[async_trait]
impl RpcPeer for RecordingPeer {
    async fn remote_write(&self, _id: u32, _chunk: Bytes) {}
    async fn remote_end(&self, _id: u32, _chunk: Option<Bytes>) {}
    async fn remote_destroy(&self, _id: u32) {}
    async fn remote_pause(&self, _id: u32) {}
    async fn remote_resume(&self, _id: u32) {}
}

/// A minimal readable `StreamResource` test double: feeds whatever
/// events the test hands it, and tracks whether `pause`/`resume` were
/// called.
#[derive(Debug)]
struct FixedStream {
    identity: ResourceIdentity,
    paused: AtomicBool,
    resumed: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl FixedStream {
    fn new(identity: ResourceIdentity, events: Vec<StreamEvent>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        Arc::new(Self {
            identity,
            paused: AtomicBool::new(false),
            resumed: AtomicBool::new(false),
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl StreamResource for FixedStream {
    fn identity(&self) -> ResourceIdentity {
        self.identity
    }
    fn readable(&self) -> bool {
        true
    }
    fn writable(&self) -> bool {
        false
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.resumed.store(true, Ordering::SeqCst);
    }
    fn destroy(&self) {}
    fn write(&self, _chunk: Bytes) -> bool {
        false
    }
    fn end(&self, _chunk: Option<Bytes>) {}
    fn take_events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.events.lock().take().expect("take_events called twice")
    }
}

fn dispatcher_over(vfs: Arc<dyn Vfs>, peer: Arc<RecordingPeer>) -> (Arc<HandleRegistry>, RpcDispatcher) {
    let registry = Arc::new(HandleRegistry::new());
    let marshaller = Arc::new(CallbackMarshaller::new(Arc::clone(&registry), peer.clone() as Arc<dyn PeerEvents>));
    let dispatcher = RpcDispatcher::new(Arc::clone(&registry), vfs, Arc::new(marshaller), peer as Arc<dyn RpcPeer>);
    (registry, dispatcher)
}

/// S6: `readfile` mints a stream token, the real file's bytes arrive via
/// `onData`, and the registry is empty again once the stream ends.
#[tokio::test]
async fn s6_readfile_stream_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("x"), b"hello stream").expect("write fixture");

    let vfs: Arc<dyn Vfs> = Arc::new(LocalVfs::new(dir.path()));
    let peer = RecordingPeer::new();
    let (registry, dispatcher) = dispatcher_over(vfs, Arc::clone(&peer));

    let (err, meta) = dispatcher.dispatch_vfs(RoutedVfsOp::Readfile, Some("/x".to_string()), VfsOptions::new(), None).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    let meta = meta.expect("meta present on success");
    assert_eq!(meta.mime.as_deref(), Some("text/plain"));

    let Some(Token::Stream(token)) = meta.stream else {
        panic!("expected a stream token");
    };
    assert_eq!(token.readable, Some(true));

    tokio::time::timeout(std::time::Duration::from_secs(5), peer.closed.notified()).await.expect("stream closed");

    let collected: Vec<u8> = peer.data.lock().iter().filter(|(id, _)| *id == token.id).flat_map(|(_, c)| c.to_vec()).collect();
    assert_eq!(collected, b"hello stream");
    assert_eq!(peer.ends.lock().as_slice(), &[token.id]);
    assert!(registry.is_empty(), "registry should be empty once the stream has closed");
}

/// §8 invariant 4: a peer rejecting a chunk pauses the source, and the
/// channel's drain event resumes it.
#[tokio::test]
async fn backpressure_pause_then_resume_on_drain() {
    let registry = Arc::new(HandleRegistry::new());
    let peer = RecordingPeer::new();
    peer.reject_next_data.store(true, Ordering::SeqCst);

    let stream = FixedStream::new(1, vec![StreamEvent::Data(Bytes::from_static(b"chunk"))]);
    let stream_dyn: Arc<dyn StreamResource> = stream.clone();
    registry.store_stream(stream_dyn, peer.clone() as Arc<dyn PeerEvents>);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(stream.paused.load(Ordering::SeqCst), "pause() should follow a false return from onData");
    assert!(!stream.resumed.load(Ordering::SeqCst));

    registry.on_channel_drain();
    assert!(stream.resumed.load(Ordering::SeqCst), "resume() should follow a channel drain");
}

/// §8 invariant 3: storing the same resource identity twice returns the
/// same token rather than minting a second id.
#[tokio::test]
async fn token_idempotence_on_repeated_store() {
    let registry = Arc::new(HandleRegistry::new());
    let peer = RecordingPeer::new();

    let stream = FixedStream::new(7, vec![]);
    let first = registry.store_stream(stream.clone(), peer.clone() as Arc<dyn PeerEvents>);
    let second = registry.store_stream(stream, peer as Arc<dyn PeerEvents>);

    assert_eq!(first.id, second.id);
}

/// §8 invariant 2: distinct resource identities never collide on id.
#[tokio::test]
async fn unique_ids_for_distinct_resources() {
    let registry = Arc::new(HandleRegistry::new());
    let peer = RecordingPeer::new();

    let a = registry.store_stream(FixedStream::new(100, vec![]), peer.clone() as Arc<dyn PeerEvents>);
    let b = registry.store_stream(FixedStream::new(200, vec![]), peer as Arc<dyn PeerEvents>);

    assert_ne!(a.id, b.id);
}

/// S7: `ping` replies with a non-negative `serverTime` in milliseconds.
#[tokio::test]
async fn s7_ping_reports_elapsed_server_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vfs: Arc<dyn Vfs> = Arc::new(LocalVfs::new(dir.path()));
    let peer = RecordingPeer::new();
    let (_registry, dispatcher) = dispatcher_over(vfs, peer);

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let reply = dispatcher.ping().await;
    let server_time = reply.get("serverTime").and_then(serde_json::Value::as_u64).expect("serverTime is a u64");
    assert!(server_time < 5_000, "sanity bound on elapsed time: {server_time}");
}
