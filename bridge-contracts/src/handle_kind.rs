//! `HandleKind`: which bucket of the Handle Registry a numeric id was
//! allocated from (`spec.md` §3, §4.1). The Registry keeps one id space
//! per kind rather than one global space, so two different kinds can
//! legally reuse the same numeric id.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    /// A stream whose source is local to this process.
    StreamLocal,
    /// A stream proxying a remote stream back out over the RPC channel.
    StreamProxy,
    Process,
    Pty,
    Watcher,
    Api,
}
