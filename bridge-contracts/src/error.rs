use thiserror::Error;

/// The VFS error taxonomy from the error-normalization design (`spec.md` §7).
///
/// One enum serves both surfaces: the HTTP Gateway maps it to a status code,
/// the RPC Callback Marshaller maps it to an [`crate::ErrorEnvelope`].
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("is a directory: {0}")]
    IsDir(String),

    /// A numeric `err.code` in `[100,999]` that passes through verbatim as
    /// the HTTP status.
    #[error("{message} (code {code})")]
    Coded { code: u16, message: String },

    #[error("invalid path")]
    InvalidPath,

    #[error("disconnected")]
    Disconnect,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// `err.message || err.toString()` per §7's "Body on error" rule.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// True for the one taxonomy entry the HTTP Gateway is allowed to
    /// silence in logs (§7: "Only `ENOENT` errors are silenced in logs").
    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }
}

pub type VfsResult<T> = std::result::Result<T, VfsError>;
