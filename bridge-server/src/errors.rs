//! `GatewayError`: transport-level failures the HTTP Gateway hits
//! before it ever reaches a `Vfs` call — a malformed multipart body, a
//! missing header, a body read failure. `VfsError` responses go through
//! `bridge_core::ErrorNormalizer` instead (§7); this type only covers
//! what that taxonomy doesn't reach. Mirrors `ferrex-server::errors::AppError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub struct GatewayError {
    pub status: StatusCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": { "message": self.message, "status": self.status.as_u16() } }));
        (self.status, body).into_response()
    }
}

impl From<multer::Error> for GatewayError {
    fn from(err: multer::Error) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}
