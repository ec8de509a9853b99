//! Stream adapters bridging axum request/response bodies to
//! `bridge_contracts::StreamResource` — the same shape `vfs_local`'s
//! `ReadableByteStream` uses, adapted to pull from a `futures` `Stream`
//! of byte chunks rather than an `AsyncRead`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::body::Body;
use bridge_contracts::{ResourceIdentity, StreamEvent, StreamResource};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, Notify};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

fn next_identity() -> ResourceIdentity {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Wraps an inbound request (or multipart field) byte stream as a
/// readable-only `StreamResource`, so PUT/POST upload bodies can be
/// handed to `Vfs::mkfile` the same way any other stream option is.
#[derive(Debug)]
pub struct RequestBodyStream {
    identity: ResourceIdentity,
    destroyed: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    wake: Arc<Notify>,
    events: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl RequestBodyStream {
    pub fn spawn<S, E>(mut source: S) -> Arc<dyn StreamResource>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let destroyed = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let task_destroyed = destroyed.clone();
        let task_paused = paused.clone();
        let task_wake = wake.clone();

        tokio::spawn(async move {
            loop {
                if task_destroyed.load(Ordering::Acquire) {
                    let _ = tx.send(StreamEvent::Close);
                    return;
                }
                if task_paused.load(Ordering::Acquire) {
                    task_wake.notified().await;
                    continue;
                }
                match source.next().await {
                    Some(Ok(chunk)) => {
                        if tx.send(StreamEvent::Data(chunk)).is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(StreamEvent::Error(err.to_string()));
                        return;
                    }
                    None => {
                        let _ = tx.send(StreamEvent::End(None));
                        return;
                    }
                }
            }
        });

        Arc::new(Self {
            identity: next_identity(),
            destroyed,
            paused,
            wake,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait::async_trait]
impl StreamResource for RequestBodyStream {
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
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake.notify_waiters();
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    fn write(&self, _chunk: Bytes) -> bool {
        false
    }

    fn end(&self, _chunk: Option<Bytes>) {}

    fn take_events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.events.lock().expect("poisoned").take().expect("take_events called twice")
    }
}

/// Adapts a readable `StreamResource`'s event stream into a
/// `futures::Stream` axum can drive as a response body. Destroys the
/// resource on drop if the client disconnects before the stream ends
/// naturally (`spec.md` §4.6: "on `close`, destroy the stream if still
/// readable").
struct ByteBodyStream {
    resource: Arc<dyn StreamResource>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    ended: bool,
}

impl Stream for ByteBodyStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Data(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(StreamEvent::End(Some(chunk)))) => {
                this.ended = true;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(StreamEvent::End(None))) | Poll::Ready(Some(StreamEvent::Close)) => {
                this.ended = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Error(message))) => {
                this.ended = true;
                Poll::Ready(Some(Err(std::io::Error::other(message))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ByteBodyStream {
    fn drop(&mut self) {
        if !self.ended && self.resource.readable() {
            self.resource.destroy();
        }
    }
}

pub fn stream_body(resource: Arc<dyn StreamResource>) -> Body {
    let events = resource.take_events();
    resource.resume();
    Body::from_stream(ByteBodyStream { resource, events, ended: false })
}

/// Buffers a directory-listing stream's `Data` chunks into the
/// `[\n  item,\n  item\n]` framing (`spec.md` §8 scenario S2). `readdir`
/// backends already materialize the full listing up front, so there is
/// no streaming benefit to threading this through byte-by-byte.
pub async fn drain_directory_json(resource: Arc<dyn StreamResource>) -> Bytes {
    let mut events = resource.take_events();
    resource.resume();
    let mut items = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(chunk) => items.push(chunk),
            StreamEvent::End(Some(chunk)) => {
                items.push(chunk);
                break;
            }
            StreamEvent::End(None) | StreamEvent::Close | StreamEvent::Error(_) => break,
        }
    }

    if items.is_empty() {
        return Bytes::from_static(b"[]");
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"[\n  ");
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.extend_from_slice(b",\n  ");
        }
        out.extend_from_slice(item);
    }
    out.extend_from_slice(b"\n]");
    Bytes::from(out)
}
