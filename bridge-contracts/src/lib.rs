//! Trait surfaces and wire types shared by the VFS access bridge.
//!
//! No I/O lives in this crate. `bridge-core` implements the
//! connection-level machinery (registry, dispatcher, flow control)
//! against these traits; `bridge-server` supplies a concrete [`Vfs`] and
//! the axum transport.

pub mod capabilities;
pub mod envelope;
pub mod error;
pub mod handle_kind;
pub mod meta;
pub mod token;
pub mod vfs;

pub use capabilities::{
    ApiResource, ChangeEvent, ProcessEvent, ProcessResource, PtyEvent, PtyResource, ResourceIdentity, StreamEvent,
    StreamResource, WatcherResource,
};
pub use envelope::ErrorEnvelope;
pub use error::{VfsError, VfsResult};
pub use handle_kind::HandleKind;
pub use meta::{Meta, PartialContent};
pub use token::{ApiToken, ProcessToken, PtyToken, StreamToken, Token, WatcherToken};
pub use vfs::{EventSink, Vfs, VfsOptions};
