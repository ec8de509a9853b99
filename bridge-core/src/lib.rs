//! Connection-level machinery for the VFS access bridge. See the crate
//! README for the boundary between this crate and `bridge-server`.

pub mod dispatcher;
pub mod error_normalizer;
pub mod flow_control;
pub mod id_alloc;
pub mod marshaller;
pub mod registry;
pub mod stream_proxy;

pub use dispatcher::{RoutedVfsOp, RpcDispatcher};
pub use error_normalizer::{ErrorNormalizer, ErrorNormalizerConfig};
pub use flow_control::FlowController;
pub use id_alloc::RollingIdAllocator;
pub use marshaller::{CallbackMarshaller, PartialContentWire, WireMeta};
pub use registry::{HandleRegistry, PeerEvents};
pub use stream_proxy::{RpcPeer, StreamProxy};
