//! `ErrorEnvelope`: the shape an RPC error reply is serialized to (§7).
//! The HTTP Gateway's JSON error body uses the same shape so both
//! surfaces read identically in client logs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl From<&crate::error::VfsError> for ErrorEnvelope {
    fn from(err: &crate::error::VfsError) -> Self {
        let code = match err {
            crate::error::VfsError::Coded { code, .. } => Some(*code),
            _ => None,
        };
        Self {
            message: err.message(),
            code,
        }
    }
}
