//! `LocalVfs`: a reference `Vfs` implementation over `tokio::fs`,
//! `notify` and `tokio::process`, sandboxed to a configured root
//! directory. Grounded on `ferrex-core/src/fs_watch/mod.rs` (a watcher
//! module is first-class in this family) and on
//! `ferrex-server/src/stream/stream_handlers.rs`'s "open, wrap in a byte
//! stream, set headers from extension" pattern, generalized here from
//! media files to arbitrary VFS paths.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_contracts::{
    ApiResource, ChangeEvent, EventSink, Meta, PartialContent, ProcessEvent, ProcessResource, PtyEvent, PtyResource,
    ResourceIdentity, StreamEvent, StreamResource, Vfs, VfsError, VfsOptions, VfsResult, WatcherResource,
};
use bytes::Bytes;
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};

/// Ports `ferrex-server`'s `stream_handlers::parse_range_header` (single
/// `bytes=S-E` / `bytes=S-` / `bytes=-N` range, clamped to file size).
fn parse_byte_range(range_str: &str, file_size: u64) -> Option<(u64, u64)> {
    let range_part = range_str.strip_prefix("bytes=")?;
    let (start_str, end_str) = range_part.split_once('-')?;

    let start = if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        file_size.saturating_sub(suffix_len)
    } else {
        start_str.parse().ok()?
    };

    let end = if end_str.is_empty() || start_str.is_empty() {
        file_size.saturating_sub(1)
    } else {
        std::cmp::min(end_str.parse().ok()?, file_size.saturating_sub(1))
    };

    (start <= end && start < file_size).then_some((start, end))
}

fn next_identity() -> ResourceIdentity {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn io_err(err: std::io::Error) -> VfsError {
    if err.kind() == std::io::ErrorKind::NotFound {
        VfsError::NotFound(err.to_string())
    } else {
        VfsError::Io(err)
    }
}

/// A readable byte stream reading chunks out of any `AsyncRead`,
/// respecting remote `pause`/`resume`/`destroy` (§4.1, §4.4). Backs
/// `readfile`, process `stdout`/`stderr`, and PTY output.
#[derive(Debug)]
struct ReadableByteStream {
    identity: ResourceIdentity,
    paused: AtomicBool,
    destroyed: AtomicBool,
    wake: Notify,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl ReadableByteStream {
    fn spawn<R>(mut reader: R) -> Arc<Self>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            identity: next_identity(),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            wake: Notify::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });

        let worker = Arc::clone(&this);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                if worker.destroyed.load(Ordering::Acquire) {
                    let _ = worker.events_tx.send(StreamEvent::Close);
                    return;
                }
                if worker.paused.load(Ordering::Acquire) {
                    worker.wake.notified().await;
                    continue;
                }
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        let _ = worker.events_tx.send(StreamEvent::End(None));
                        let _ = worker.events_tx.send(StreamEvent::Close);
                        return;
                    }
                    Ok(n) => {
                        let _ = worker.events_tx.send(StreamEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                    }
                    Err(err) => {
                        let _ = worker.events_tx.send(StreamEvent::Error(err.to_string()));
                        let _ = worker.events_tx.send(StreamEvent::Close);
                        return;
                    }
                }
            }
        });
        this
    }
}

#[async_trait]
impl StreamResource for ReadableByteStream {
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
        self.events_rx.lock().take().expect("ReadableByteStream::take_events called twice")
    }
}

/// Drip-feeds a precomputed sequence of chunks, same pause/destroy
/// semantics as `ReadableByteStream`. Backs `readdir`'s directory JSON
/// object stream (§4.6: "stream is an object stream").
#[derive(Debug)]
struct ChunkFeedStream {
    identity: ResourceIdentity,
    paused: AtomicBool,
    destroyed: AtomicBool,
    wake: Notify,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl ChunkFeedStream {
    fn spawn(chunks: Vec<Bytes>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            identity: next_identity(),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            wake: Notify::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });

        let worker = Arc::clone(&this);
        tokio::spawn(async move {
            for chunk in chunks {
                loop {
                    if worker.destroyed.load(Ordering::Acquire) {
                        let _ = worker.events_tx.send(StreamEvent::Close);
                        return;
                    }
                    if worker.paused.load(Ordering::Acquire) {
                        worker.wake.notified().await;
                        continue;
                    }
                    break;
                }
                let _ = worker.events_tx.send(StreamEvent::Data(chunk));
            }
            let _ = worker.events_tx.send(StreamEvent::End(None));
            let _ = worker.events_tx.send(StreamEvent::Close);
        });
        this
    }
}

#[async_trait]
impl StreamResource for ChunkFeedStream {
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
        self.events_rx.lock().take().expect("ChunkFeedStream::take_events called twice")
    }
}

enum WriteCmd {
    Write(Bytes),
    End,
}

/// A writable-only stream forwarding `write`/`end` calls into an
/// `AsyncWrite` sink (process stdin). Readable consumers never see
/// events from it besides a terminal `Close` once the sink is drained.
#[derive(Debug)]
struct WritableByteSink {
    identity: ResourceIdentity,
    cmd_tx: mpsc::UnboundedSender<WriteCmd>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl WritableByteSink {
    fn spawn<W>(mut writer: W) -> Arc<Self>
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<WriteCmd>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closing_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    WriteCmd::Write(chunk) => {
                        if writer.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    WriteCmd::End => break,
                }
            }
            let _ = writer.shutdown().await;
            let _ = closing_tx.send(StreamEvent::Close);
        });

        Arc::new(Self { identity: next_identity(), cmd_tx, events_tx, events_rx: Mutex::new(Some(events_rx)) })
    }
}

#[async_trait]
impl StreamResource for WritableByteSink {
    fn identity(&self) -> ResourceIdentity {
        self.identity
    }
    fn readable(&self) -> bool {
        false
    }
    fn writable(&self) -> bool {
        true
    }
    fn pause(&self) {}
    fn resume(&self) {}
    fn destroy(&self) {
        let _ = self.cmd_tx.send(WriteCmd::End);
    }
    fn write(&self, chunk: Bytes) -> bool {
        self.cmd_tx.send(WriteCmd::Write(chunk)).is_ok()
    }
    fn end(&self, chunk: Option<Bytes>) {
        if let Some(chunk) = chunk {
            let _ = self.cmd_tx.send(WriteCmd::Write(chunk));
        }
        let _ = self.cmd_tx.send(WriteCmd::End);
    }
    fn take_events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.events_rx.lock().take().expect("WritableByteSink::take_events called twice")
    }
}

/// Drains a readable `options.stream` (an upload body, §4.6 PUT/POST) into
/// a file, writing chunks as they arrive.
async fn drain_stream_to_file(stream: Arc<dyn StreamResource>, mut file: tokio::fs::File) -> VfsResult<u64> {
    let mut events = stream.take_events();
    let mut written: u64 = 0;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(chunk) => {
                file.write_all(&chunk).await.map_err(io_err)?;
                written += chunk.len() as u64;
            }
            StreamEvent::End(Some(chunk)) => {
                file.write_all(&chunk).await.map_err(io_err)?;
                written += chunk.len() as u64;
                break;
            }
            StreamEvent::End(None) | StreamEvent::Close => break,
            StreamEvent::Error(message) => return Err(VfsError::Other(message)),
        }
    }
    file.flush().await.map_err(io_err)?;
    Ok(written)
}

struct ChildHandle {
    child: Mutex<Child>,
}

struct ChildProcessResource {
    identity: ResourceIdentity,
    pid: u32,
    stdin: Option<Arc<WritableByteSink>>,
    stdout: Option<Arc<ReadableByteStream>>,
    stderr: Option<Arc<ReadableByteStream>>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ProcessEvent>>>,
    handle: Arc<ChildHandle>,
}

impl std::fmt::Debug for ChildProcessResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessResource").field("pid", &self.pid).finish()
    }
}

#[async_trait]
impl ProcessResource for ChildProcessResource {
    fn identity(&self) -> ResourceIdentity {
        self.identity
    }
    fn pid(&self) -> u32 {
        self.pid
    }
    fn stdin(&self) -> Option<Arc<dyn StreamResource>> {
        self.stdin.clone().map(|s| s as Arc<dyn StreamResource>)
    }
    fn stdout(&self) -> Option<Arc<dyn StreamResource>> {
        self.stdout.clone().map(|s| s as Arc<dyn StreamResource>)
    }
    fn stderr(&self) -> Option<Arc<dyn StreamResource>> {
        self.stderr.clone().map(|s| s as Arc<dyn StreamResource>)
    }
    fn kill(&self, _code: Option<i32>) {
        let _ = self.handle.child.lock().start_kill();
    }
    fn unref(&self) {}
    fn take_events(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        self.events_rx.lock().take().expect("ChildProcessResource::take_events called twice")
    }
}

/// `Child::wait` takes `&mut self` across an await point; holding the
/// `parking_lot::Mutex` guard there isn't `Send`, so exit is polled
/// through `try_wait` instead.
fn spawn_exit_watcher(handle: Arc<ChildHandle>, events_tx: mpsc::UnboundedSender<ProcessEvent>) {
    tokio::spawn(async move {
        let status = loop {
            match handle.child.lock().try_wait().transpose() {
                Some(status) => break status,
                None => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            }
        };
        let code = status.as_ref().ok().and_then(|s| s.code());
        let _ = events_tx.send(ProcessEvent::Exit { code, signal: None });
        let _ = events_tx.send(ProcessEvent::Close { code, signal: None });
    });
}

/// A merged process+stream handle (§3: "A PTY handle is a process and a
/// stream sharing one token"). No real controlling terminal is
/// allocated (process/PTY spawning mechanics are out of scope); stdout
/// and stderr are merged into one event stream instead.
struct LocalPty {
    identity: ResourceIdentity,
    pid: u32,
    paused: AtomicBool,
    destroyed: AtomicBool,
    wake: Notify,
    stdin_tx: mpsc::UnboundedSender<WriteCmd>,
    events_tx: mpsc::UnboundedSender<PtyEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PtyEvent>>>,
    handle: Arc<ChildHandle>,
}

impl std::fmt::Debug for LocalPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPty").field("pid", &self.pid).finish()
    }
}

#[async_trait]
impl PtyResource for LocalPty {
    fn identity(&self) -> ResourceIdentity {
        self.identity
    }
    fn pid(&self) -> u32 {
        self.pid
    }
    fn readable(&self) -> bool {
        true
    }
    fn writable(&self) -> bool {
        true
    }
    fn write(&self, chunk: Bytes) -> bool {
        self.stdin_tx.send(WriteCmd::Write(chunk)).is_ok()
    }
    fn end(&self, chunk: Option<Bytes>) {
        if let Some(chunk) = chunk {
            let _ = self.stdin_tx.send(WriteCmd::Write(chunk));
        }
        let _ = self.stdin_tx.send(WriteCmd::End);
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
    fn kill(&self, _code: Option<i32>) {
        let _ = self.handle.child.lock().start_kill();
    }
    /// "must swallow failures from the underlying resize call" (§4.5) —
    /// there is no real terminal here to resize, so this is a no-op.
    fn resize(&self, _cols: u16, _rows: u16) {}
    fn take_events(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        self.events_rx.lock().take().expect("LocalPty::take_events called twice")
    }
}

struct LocalWatcher {
    identity: ResourceIdentity,
    watcher: Mutex<Option<RecommendedWatcher>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
}

impl std::fmt::Debug for LocalWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWatcher").finish()
    }
}

#[async_trait]
impl WatcherResource for LocalWatcher {
    fn identity(&self) -> ResourceIdentity {
        self.identity
    }
    fn close(&self) {
        self.watcher.lock().take();
    }
    fn take_events(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.events_rx.lock().take().expect("LocalWatcher::take_events called twice")
    }
}

/// A small in-process plugin registry reachable through `extend`/`use`
/// (§3/§4.1). `EchoApi` is the one concrete API this reference backend
/// ships: it exists so `use_api`/`call` have something real to exercise
/// end-to-end.
#[derive(Debug)]
struct EchoApi {
    name: String,
}

#[async_trait]
impl ApiResource for EchoApi {
    fn name(&self) -> &str {
        &self.name
    }
    fn names(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }
    async fn call(&self, method: &str, args: Vec<Value>) -> VfsResult<Value> {
        match method {
            "echo" => Ok(Value::Array(args)),
            other => Err(VfsError::BadRequest(format!("unknown method {other} on api {}", self.name))),
        }
    }
}

struct EventSubscribers {
    next_id: AtomicU64,
    sinks: DashMap<String, Vec<(u64, EventSink)>>,
}

/// `bridge_contracts::Vfs` over a sandboxed directory tree.
pub struct LocalVfs {
    root: PathBuf,
    children: DashMap<u32, Arc<ChildHandle>>,
    apis: DashMap<String, Arc<dyn ApiResource>>,
    events: EventSubscribers,
}

impl LocalVfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            children: DashMap::new(),
            apis: DashMap::new(),
            events: EventSubscribers { next_id: AtomicU64::new(1), sinks: DashMap::new() },
        }
    }

    /// Resolves a VFS path against the sandbox root, rejecting escapes
    /// (§10.7: "`resolve` canonicalizes and rejects escapes above
    /// `vfs.root`"). The path need not exist yet (callers creating a new
    /// file/directory resolve the parent instead).
    fn sandbox_path(&self, path: &str) -> VfsResult<PathBuf> {
        let relative = path.trim_start_matches('/');
        let joined = self.root.join(relative);
        let root = self.root.canonicalize().map_err(io_err)?;

        // walk up to the nearest existing ancestor (may be several levels
        // up when `parents: true` still has to create intermediate dirs)
        // and rebuild the full path from its canonical form.
        let mut existing = joined.as_path();
        let mut tail = Vec::new();
        while !existing.exists() {
            tail.push(existing.file_name().map(|s| s.to_os_string()).unwrap_or_default());
            existing = existing.parent().unwrap_or(&self.root);
        }
        let mut check_against = existing.canonicalize().map_err(io_err)?;
        for component in tail.into_iter().rev() {
            check_against.push(component);
        }

        if !check_against.starts_with(&root) {
            return Err(VfsError::Forbidden(format!("path escapes vfs root: {path}")));
        }
        Ok(joined)
    }

}

#[async_trait]
impl Vfs for LocalVfs {
    async fn resolve(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        Ok(Meta::new().with_extra("path", resolved.to_string_lossy().to_string()))
    }

    async fn stat(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(io_err)?;

        let mut meta = Meta::new().with_extra("isDirectory", metadata.is_dir()).with_extra("isFile", metadata.is_file());
        meta.size = Some(metadata.len());
        Ok(meta)
    }

    async fn metadata(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(io_err)?;
        let body = json!({
            "size": metadata.len(),
            "modified": metadata.modified().ok().and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_secs()),
        });
        let encoded = serde_json::to_string(&body).unwrap_or_default();
        let mut meta = Meta::new();
        meta.metadata_size = Some(metadata.len());
        meta.metadata_string_length = Some(encoded.len());
        Ok(meta.with_extra("metadata", body))
    }

    async fn readfile(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(io_err)?;
        if metadata.is_dir() {
            return Err(VfsError::IsDir(path.to_string()));
        }
        let size = metadata.len();
        let mtime = metadata.modified().ok().and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_secs()).unwrap_or(0);
        let etag = format!("\"{mtime:x}-{size:x}\"");
        let mime = mime_guess::from_path(&resolved).first_or_octet_stream().essence_str().to_string();

        let mut meta = Meta::new();
        meta.etag = Some(etag.clone());
        meta.mime = Some(mime);

        if options.get_str("etag") == Some(etag.as_str()) {
            meta.not_modified = Some(true);
            return Ok(meta);
        }

        // `If-Range` (§4.6, §6.2): a stale etag means serve the full body instead of the range.
        let if_range_matches = options.get_str("ifRange").is_none_or(|want| want == etag);

        if if_range_matches && let Some(range_header) = options.get_str("range") {
            return match parse_byte_range(range_header, size) {
                Some((start, end)) => {
                    let mut file = tokio::fs::File::open(&resolved).await.map_err(io_err)?;
                    file.seek(std::io::SeekFrom::Start(start)).await.map_err(io_err)?;
                    meta.partial_content = Some(PartialContent { start, end, size });
                    meta.size = Some(end - start + 1);
                    meta.stream = Some(ReadableByteStream::spawn(file.take(end - start + 1)));
                    Ok(meta)
                }
                None => {
                    meta.range_not_satisfiable = Some(format!("Range not satisfiable for size {size}\n"));
                    Ok(meta)
                }
            };
        }

        let file = tokio::fs::File::open(&resolved).await.map_err(io_err)?;
        meta.size = Some(size);

        if options.get_bool("metadata") == Some(true) {
            let encoded = serde_json::to_vec(&json!({ "size": size, "modified": mtime })).unwrap_or_default();
            meta.metadata_size = Some(size);
            meta.metadata_string_length = Some(encoded.len());

            // Bundle the metadata ahead of the file's bytes in one stream
            // (`X-Content-Length`/`X-Metadata-Length` split them back apart
            // on the gateway side) rather than buffering the whole file to
            // concatenate it up front.
            let (mut writer, reader) = tokio::io::duplex(8192);
            let mut file = file;
            tokio::spawn(async move {
                if writer.write_all(&encoded).await.is_err() {
                    return;
                }
                let _ = tokio::io::copy(&mut file, &mut writer).await;
            });
            meta.stream = Some(ReadableByteStream::spawn(reader));
        } else {
            meta.stream = Some(ReadableByteStream::spawn(file));
        }

        Ok(meta)
    }

    async fn readdir(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        let mut entries = tokio::fs::read_dir(&resolved).await.map_err(io_err)?;
        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_type = entry.file_type().await.map_err(io_err)?;
            let record = json!({
                "name": entry.file_name().to_string_lossy(),
                "isDirectory": file_type.is_dir(),
                "isFile": file_type.is_file(),
            });
            chunks.push(Bytes::from(serde_json::to_vec(&record).unwrap_or_default()));
        }
        let stream = ChunkFeedStream::spawn(chunks);
        Ok(Meta::new().with_stream(stream))
    }

    async fn mkfile(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        if options.get_bool("parents") == Some(true)
            && let Some(parent) = resolved.parent()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = tokio::fs::File::create(&resolved).await.map_err(io_err)?;
        let written = match options.stream {
            Some(stream) => drain_stream_to_file(stream, file).await?,
            None => 0,
        };
        Ok(Meta::new().with_extra("size", written))
    }

    async fn mkdir(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        tokio::fs::create_dir(&resolved).await.map_err(io_err)?;
        Ok(Meta::new())
    }

    async fn mkdir_p(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        tokio::fs::create_dir_all(&resolved).await.map_err(io_err)?;
        Ok(Meta::new())
    }

    async fn appendfile(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        let file = tokio::fs::OpenOptions::new().append(true).create(true).open(&resolved).await.map_err(io_err)?;
        let written = match options.stream {
            Some(stream) => drain_stream_to_file(stream, file).await?,
            None => 0,
        };
        Ok(Meta::new().with_extra("size", written))
    }

    async fn rmfile(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        tokio::fs::remove_file(&resolved).await.map_err(io_err)?;
        Ok(Meta::new())
    }

    async fn rmdir(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        if options.get_bool("recursive") == Some(true) {
            tokio::fs::remove_dir_all(&resolved).await.map_err(io_err)?;
        } else {
            tokio::fs::remove_dir(&resolved).await.map_err(io_err)?;
        }
        Ok(Meta::new())
    }

    async fn rename(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let from = options.get_str("from").ok_or_else(|| VfsError::BadRequest("rename: missing from".into()))?;
        let from = self.sandbox_path(from)?;
        let to = self.sandbox_path(path)?;
        tokio::fs::rename(&from, &to).await.map_err(io_err)?;
        Ok(Meta::new())
    }

    async fn copy(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let from = options.get_str("from").ok_or_else(|| VfsError::BadRequest("copy: missing from".into()))?;
        let from = self.sandbox_path(from)?;
        let to = self.sandbox_path(path)?;
        tokio::fs::copy(&from, &to).await.map_err(io_err)?;
        Ok(Meta::new())
    }

    async fn chmod(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = options.get_u64("mode").ok_or_else(|| VfsError::BadRequest("chmod: missing mode".into()))?;
            let permissions = std::fs::Permissions::from_mode(mode as u32);
            tokio::fs::set_permissions(&resolved, permissions).await.map_err(io_err)?;
        }
        #[cfg(not(unix))]
        {
            let _ = resolved;
            return Err(VfsError::BadRequest("chmod is not supported on this platform".into()));
        }
        Ok(Meta::new())
    }

    async fn symlink(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let target = options.get_str("target").ok_or_else(|| VfsError::BadRequest("symlink: missing target".into()))?;
        let link = self.sandbox_path(path)?;
        #[cfg(unix)]
        tokio::fs::symlink(target, &link).await.map_err(io_err)?;
        #[cfg(not(unix))]
        {
            let _ = (target, link);
            return Err(VfsError::BadRequest("symlink is not supported on this platform".into()));
        }
        Ok(Meta::new())
    }

    async fn watch(&self, path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let resolved = self.sandbox_path(path)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            let change = ChangeEvent {
                event: format!("{:?}", event.kind),
                filename: event.paths.first().map(|p| p.to_string_lossy().to_string()),
                stat: None,
                files: Some(event.paths.iter().map(|p| p.to_string_lossy().to_string()).collect()),
            };
            let _ = events_tx.send(change);
        })
        .map_err(|err| VfsError::Other(err.to_string()))?;

        watcher.watch(&resolved, RecursiveMode::Recursive).map_err(|err| VfsError::Other(err.to_string()))?;

        let watcher = Arc::new(LocalWatcher {
            identity: next_identity(),
            watcher: Mutex::new(Some(watcher)),
            events_rx: Mutex::new(Some(events_rx)),
        });
        Ok(Meta::new().with_watcher(watcher))
    }

    async fn connect(&self, _path: &str, _options: VfsOptions) -> VfsResult<Meta> {
        Err(VfsError::NotReady("connect: no transport configured for this reference backend".into()))
    }

    async fn spawn(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let mut cmd = Command::new(path);
        if let Some(args) = options.get("args").and_then(Value::as_array) {
            for arg in args {
                if let Some(s) = arg.as_str() {
                    cmd.arg(s);
                }
            }
        }
        cmd.current_dir(match options.get_str("cwd") {
            Some(cwd) => self.sandbox_path(cwd)?,
            None => self.root.clone(),
        });
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(io_err)?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().map(WritableByteSink::spawn);
        let stdout = child.stdout.take().map(ReadableByteStream::spawn);
        let stderr = child.stderr.take().map(ReadableByteStream::spawn);

        let handle = Arc::new(ChildHandle { child: Mutex::new(child) });
        self.children.insert(pid, Arc::clone(&handle));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        spawn_exit_watcher(Arc::clone(&handle), events_tx.clone());

        let resource = Arc::new(ChildProcessResource {
            identity: next_identity(),
            pid,
            stdin,
            stdout,
            stderr,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            handle,
        });
        Ok(Meta::new().with_process(resource))
    }

    async fn killtree(&self, pid: u32, _options: VfsOptions) -> VfsResult<Meta> {
        let Some((_, handle)) = self.children.remove(&pid) else {
            return Err(VfsError::NotFound(format!("no such process: {pid}")));
        };
        handle.child.lock().start_kill().map_err(io_err)?;
        Ok(Meta::new())
    }

    async fn pty(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        let mut cmd = Command::new(path);
        if let Some(args) = options.get("args").and_then(Value::as_array) {
            for arg in args {
                if let Some(s) = arg.as_str() {
                    cmd.arg(s);
                }
            }
        }
        cmd.current_dir(&self.root);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(io_err)?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let handle = Arc::new(ChildHandle { child: Mutex::new(child) });
        self.children.insert(pid, Arc::clone(&handle));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let paused = Arc::new(AtomicBool::new(false));
        let destroyed = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        if let Some(mut stdout) = stdout {
            let tx = events_tx.clone();
            let paused = Arc::clone(&paused);
            let destroyed = Arc::clone(&destroyed);
            let wake = Arc::clone(&wake);
            tokio::spawn(async move { pump_pty_reader(&mut stdout, tx, paused, destroyed, wake).await });
        }
        if let Some(mut stderr) = stderr {
            let tx = events_tx.clone();
            let paused = Arc::clone(&paused);
            let destroyed = Arc::clone(&destroyed);
            let wake = Arc::clone(&wake);
            tokio::spawn(async move { pump_pty_reader(&mut stderr, tx, paused, destroyed, wake).await });
        }

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<WriteCmd>();
        if let Some(mut stdin) = stdin {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    match cmd {
                        WriteCmd::Write(chunk) => {
                            if stdin.write_all(&chunk).await.is_err() {
                                break;
                            }
                        }
                        WriteCmd::End => break,
                    }
                }
                let _ = stdin.shutdown().await;
            });
        }

        let exit_tx = events_tx.clone();
        let exit_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let status = loop {
                let status = exit_handle.child.lock().try_wait().transpose();
                match status {
                    Some(Ok(status)) => break Ok(status),
                    Some(Err(err)) => break Err(err),
                    None => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                }
            };
            let code = status.as_ref().ok().and_then(|s| s.code());
            let _ = exit_tx.send(PtyEvent::Process(ProcessEvent::Exit { code, signal: None }));
            let _ = exit_tx.send(PtyEvent::Process(ProcessEvent::Close { code, signal: None }));
        });

        let resource = Arc::new(LocalPty {
            identity: next_identity(),
            pid,
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            wake: Notify::new(),
            stdin_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            handle,
        });
        Ok(Meta::new().with_pty(resource))
    }

    async fn tmux(&self, path: &str, mut options: VfsOptions) -> VfsResult<Meta> {
        let session = path.trim_start_matches('/').replace('/', "-");
        let session = if session.is_empty() { "default".to_string() } else { session };
        let command_args = options.get("args").cloned().unwrap_or(Value::Array(vec![]));
        let mut args = vec![json!("new-session"), json!("-A"), json!("-s"), json!(session)];
        if let Value::Array(extra) = command_args {
            args.extend(extra);
        }
        options.insert("args", Value::Array(args));
        self.pty("tmux", options).await
    }

    async fn exec_file(&self, path: &str, options: VfsOptions) -> VfsResult<Meta> {
        self.spawn(path, options).await
    }

    async fn extend(&self, name: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let api: Arc<dyn ApiResource> = Arc::new(EchoApi { name: name.to_string() });
        self.apis.insert(name.to_string(), Arc::clone(&api));
        Ok(Meta::new().with_api(api))
    }

    async fn unextend(&self, name: &str, _options: VfsOptions) -> VfsResult<Meta> {
        self.apis.remove(name);
        Ok(Meta::new())
    }

    async fn use_api(&self, name: &str, _options: VfsOptions) -> VfsResult<Meta> {
        let api = self.apis.get(name).map(|e| Arc::clone(e.value())).ok_or_else(|| VfsError::NotFound(format!("no such api: {name}")))?;
        Ok(Meta::new().with_api(api))
    }

    fn env(&self) -> Value {
        json!({
            "root": self.root.to_string_lossy(),
            "platform": std::env::consts::OS,
        })
    }

    async fn on(&self, event: &str, sink: EventSink) -> u64 {
        let id = self.events.next_id.fetch_add(1, Ordering::Relaxed);
        self.events.sinks.entry(event.to_string()).or_default().push((id, sink));
        id
    }

    async fn off(&self, event: &str, sink_id: u64) {
        if let Some(mut subscribers) = self.events.sinks.get_mut(event) {
            subscribers.retain(|(id, _)| *id != sink_id);
        }
    }

    async fn emit(&self, event: &str, value: Value) {
        if let Some(subscribers) = self.events.sinks.get(event) {
            for (_, sink) in subscribers.iter() {
                let _ = sink.send(value.clone());
            }
        }
    }
}

async fn pump_pty_reader<R>(
    reader: &mut R,
    tx: mpsc::UnboundedSender<PtyEvent>,
    paused: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    wake: Arc<Notify>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if destroyed.load(Ordering::Acquire) {
            return;
        }
        if paused.load(Ordering::Acquire) {
            wake.notified().await;
            continue;
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(PtyEvent::Stream(StreamEvent::End(None)));
                return;
            }
            Ok(n) => {
                let _ = tx.send(PtyEvent::Stream(StreamEvent::Data(Bytes::copy_from_slice(&buf[..n]))));
            }
            Err(err) => {
                let _ = tx.send(PtyEvent::Stream(StreamEvent::Error(err.to_string())));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readfile_roundtrips_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        let vfs = LocalVfs::new(dir.path());

        let meta = vfs.readfile("/hello.txt", VfsOptions::new()).await.unwrap();
        assert_eq!(meta.size, Some(11));
        let stream = meta.stream.unwrap();
        let mut events = stream.take_events();
        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Data(chunk) => collected.extend_from_slice(&chunk),
                StreamEvent::End(_) => break,
                _ => {}
            }
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn sandbox_path_rejects_escape_above_root() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs::new(dir.path());
        let result = vfs.stat("/../outside", VfsOptions::new()).await;
        assert!(matches!(result, Err(VfsError::Forbidden(_)) | Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn mkfile_writes_upload_stream_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs::new(dir.path());

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StreamEvent::Data(Bytes::from_static(b"payload"))).unwrap();
        tx.send(StreamEvent::End(None)).unwrap();
        let stream = Arc::new(FixedUploadStream { rx: Mutex::new(Some(rx)) });

        vfs.mkfile("/upload.bin", VfsOptions::new().with_stream(stream)).await.unwrap();
        let written = std::fs::read(dir.path().join("upload.bin")).unwrap();
        assert_eq!(written, b"payload");
    }

    #[derive(Debug)]
    struct FixedUploadStream {
        rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
    }

    #[async_trait]
    impl StreamResource for FixedUploadStream {
        fn identity(&self) -> ResourceIdentity {
            0
        }
        fn readable(&self) -> bool {
            true
        }
        fn writable(&self) -> bool {
            false
        }
        fn pause(&self) {}
        fn resume(&self) {}
        fn destroy(&self) {}
        fn write(&self, _chunk: Bytes) -> bool {
            false
        }
        fn end(&self, _chunk: Option<Bytes>) {}
        fn take_events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
            self.rx.lock().take().unwrap()
        }
    }
}
