//! The Callback Marshaller (`spec.md` §4.3): turns a `Result<Meta,
//! VfsError>` into the wire shapes both transports send back —
//! `ErrorEnvelope` on failure, a token-projected `WireMeta` on success.

use std::sync::Arc;

use bridge_contracts::{Meta, PartialContent, Token, VfsError, VfsResult};
use serde::Serialize;

use crate::registry::{HandleRegistry, PeerEvents};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialContentWire {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl From<PartialContent> for PartialContentWire {
    fn from(p: PartialContent) -> Self {
        Self { start: p.start, end: p.end, size: p.size }
    }
}

/// The peer-visible projection of a `Meta`: every resource key becomes a
/// `Token`, everything else passes through.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<Token>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_modified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_content: Option<PartialContentWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_not_satisfiable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_string_length: Option<usize>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct CallbackMarshaller {
    registry: Arc<HandleRegistry>,
    peer: Arc<dyn PeerEvents>,
}

impl CallbackMarshaller {
    pub fn new(registry: Arc<HandleRegistry>, peer: Arc<dyn PeerEvents>) -> Self {
        Self { registry, peer }
    }

    /// `{stack: "<pid>: "+stack, code?, message?}` (§4.3, §9 "Serializable
    /// errors"). `stdout`/`stderr` are left to callers that have them
    /// (spawn/execFile failures); plain VFS errors never carry them.
    pub fn marshal_error(&self, err: &VfsError) -> bridge_contracts::ErrorEnvelope {
        let mut envelope = bridge_contracts::ErrorEnvelope::from(err);
        envelope.message = format!("{}: {}", std::process::id(), envelope.message);
        envelope
    }

    pub fn marshal_meta(&self, meta: Meta) -> WireMeta {
        let stream = meta
            .stream
            .map(|s| Token::Stream(self.registry.store_stream(s, Arc::clone(&self.peer))));
        let process = meta
            .process
            .map(|p| Token::Process(self.registry.store_process(p, Arc::clone(&self.peer))));
        let pty = meta.pty.map(|p| Token::Pty(self.registry.store_pty(p, Arc::clone(&self.peer))));
        let watcher = meta
            .watcher
            .map(|w| Token::Watcher(self.registry.store_watcher(w, Arc::clone(&self.peer))));
        let api = meta.api.map(|a| Token::Api(self.registry.store_api(a)));

        WireMeta {
            stream,
            process,
            pty,
            watcher,
            api,
            etag: meta.etag,
            not_modified: meta.not_modified,
            partial_content: meta.partial_content.map(Into::into),
            range_not_satisfiable: meta.range_not_satisfiable,
            mime: meta.mime,
            size: meta.size,
            metadata_size: meta.metadata_size,
            metadata_string_length: meta.metadata_string_length,
            extra: meta.extra,
        }
    }

    /// Delivers `(err, meta)` the way the source's callback convention
    /// does: an envelope-only call on error, a projected meta on
    /// success.
    pub fn deliver(&self, result: VfsResult<Meta>) -> (Option<bridge_contracts::ErrorEnvelope>, Option<WireMeta>) {
        match result {
            Ok(meta) => (None, Some(self.marshal_meta(meta))),
            Err(err) => (Some(self.marshal_error(&err)), None),
        }
    }
}
