//! `Token`: the wire projection of a `Meta`'s live resource (`spec.md`
//! §3). The Callback Marshaller builds one from a stored handle id; a
//! `Token::Stream` received over the wire is also the shape the RPC
//! Dispatcher rewrites an inbound `options.stream` into before handing a
//! [`crate::capabilities::StreamResource`] proxy to the `Vfs`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamToken {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessToken {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Box<Token>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Box<Token>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Box<Token>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyToken {
    pub pid: u32,
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherToken {
    pub id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub name: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    Process(ProcessToken),
    Pty(PtyToken),
    Watcher(WatcherToken),
    Api(ApiToken),
    /// Tried last: every other variant's field set is a strict superset
    /// or disjoint from this one, so `serde(untagged)` only falls
    /// through to it for a bare `{id, readable?, writable?}` object.
    Stream(StreamToken),
}
