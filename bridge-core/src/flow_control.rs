//! The Flow Controller (`spec.md` §4.4): two rules implementing
//! end-to-end backpressure. The peer-`onData`-returned-false half is
//! applied inline inside `HandleRegistry::store_stream`'s forwarding
//! task; this type owns the other half, reacting to the channel's own
//! `drain` signal.

use std::sync::Arc;

use crate::registry::HandleRegistry;

pub struct FlowController {
    registry: Arc<HandleRegistry>,
}

impl FlowController {
    pub fn new(registry: Arc<HandleRegistry>) -> Self {
        Self { registry }
    }

    /// Call when the transport's outbound channel signals `drain`.
    pub fn on_channel_drain(&self) {
        self.registry.on_channel_drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_contracts::{ResourceIdentity, StreamEvent, StreamResource, StreamToken};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct RecordingStream {
        resumed: AtomicBool,
        rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
    }

    #[async_trait]
    impl StreamResource for RecordingStream {
        fn identity(&self) -> ResourceIdentity {
            self as *const _ as usize
        }
        fn readable(&self) -> bool {
            true
        }
        fn writable(&self) -> bool {
            false
        }
        fn pause(&self) {}
        fn resume(&self) {
            self.resumed.store(true, Ordering::SeqCst);
        }
        fn destroy(&self) {}
        fn write(&self, _chunk: Bytes) -> bool {
            true
        }
        fn end(&self, _chunk: Option<Bytes>) {}
        fn take_events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
            self.rx.lock().take().unwrap()
        }
    }

    struct NoopPeer;
    #[async_trait]
    impl crate::registry::PeerEvents for NoopPeer {
        async fn on_data(&self, _id: u32, _chunk: Bytes) -> bool {
            true
        }
        async fn on_end(&self, _id: u32, _chunk: Option<Bytes>) {}
        async fn on_close(&self, _id: u32) {}
        async fn on_error(&self, _id: u32, _message: String) {}
        async fn on_exit(&self, _pid: u32, _code: Option<i32>, _signal: Option<String>) {}
        async fn on_process_close(&self, _pid: u32, _code: Option<i32>, _signal: Option<String>) {}
        async fn on_pty_kill(&self, _pid: u32) {}
        async fn on_change(&self, _id: u32, _event: bridge_contracts::ChangeEvent) {}
    }

    #[tokio::test]
    async fn drain_resumes_readable_streams() {
        let registry = Arc::new(HandleRegistry::new());
        let (_tx, rx) = mpsc::unbounded_channel();
        let stream = Arc::new(RecordingStream {
            resumed: AtomicBool::new(false),
            rx: parking_lot::Mutex::new(Some(rx)),
        });
        let _token: StreamToken = registry.store_stream(Arc::clone(&stream) as Arc<dyn StreamResource>, Arc::new(NoopPeer));

        let controller = FlowController::new(Arc::clone(&registry));
        controller.on_channel_drain();

        assert!(stream.resumed.load(Ordering::SeqCst));
    }
}
