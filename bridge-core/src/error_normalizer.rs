//! The Error Normalizer (`spec.md` §4.7, §7): maps the `VfsError`
//! taxonomy to an HTTP status. Shared by the HTTP Gateway directly and,
//! indirectly, by the RPC side's `ErrorEnvelope.code`.

use bridge_contracts::VfsError;
use http::StatusCode;

/// Gateway-level knobs over the otherwise-fixed taxonomy (§9 open
/// question: "keep it behind a flag if the deployment context
/// differs").
#[derive(Debug, Clone, Copy)]
pub struct ErrorNormalizerConfig {
    /// `ENOENT` → 200 is the literal, surprising behavior from §7
    /// ("client inspects Content-Type text/x-error"). Default `true`;
    /// set `false` to map it to the conventional 404 instead.
    pub enoent_as_200: bool,
}

impl Default for ErrorNormalizerConfig {
    fn default() -> Self {
        Self { enoent_as_200: true }
    }
}

pub struct ErrorNormalizer {
    config: ErrorNormalizerConfig,
}

impl ErrorNormalizer {
    pub fn new(config: ErrorNormalizerConfig) -> Self {
        Self { config }
    }

    pub fn status_for(&self, err: &VfsError) -> StatusCode {
        match err {
            VfsError::BadRequest(_) => StatusCode::BAD_REQUEST,
            VfsError::Forbidden(_) => StatusCode::FORBIDDEN,
            VfsError::NotFound(_) => {
                if self.config.enoent_as_200 {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FOUND
                }
            }
            VfsError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            VfsError::IsDir(_) => StatusCode::SERVICE_UNAVAILABLE,
            VfsError::Coded { code, .. } => StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            VfsError::InvalidPath => StatusCode::BAD_REQUEST,
            VfsError::Disconnect => StatusCode::SERVICE_UNAVAILABLE,
            VfsError::Io(_) | VfsError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// §7: "Only `ENOENT` errors are silenced in logs."
    pub fn should_silence_log(&self, err: &VfsError) -> bool {
        err.is_not_found()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enoent_maps_to_200_by_default() {
        let normalizer = ErrorNormalizer::new(ErrorNormalizerConfig::default());
        assert_eq!(normalizer.status_for(&VfsError::NotFound("x".into())), StatusCode::OK);
    }

    #[test]
    fn enoent_can_be_flagged_to_404() {
        let normalizer = ErrorNormalizer::new(ErrorNormalizerConfig { enoent_as_200: false });
        assert_eq!(normalizer.status_for(&VfsError::NotFound("x".into())), StatusCode::NOT_FOUND);
    }

    #[test]
    fn coded_errors_pass_through_verbatim() {
        let normalizer = ErrorNormalizer::new(ErrorNormalizerConfig::default());
        let err = VfsError::Coded { code: 418, message: "teapot".into() };
        assert_eq!(normalizer.status_for(&err).as_u16(), 418);
    }
}
