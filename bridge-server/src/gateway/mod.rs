//! The RESTful HTTP surface (`spec.md` §4.6). A single fallback handler
//! strips the configured mount prefix, dispatches the remainder to a
//! `Vfs` by HTTP method, and projects the returned `Meta` onto status
//! codes, headers and a body — ranges, conditional GETs, multipart
//! upload and directory JSON streaming included. Grounded on
//! `ferrex-server/src/stream/stream_handlers.rs` for range parsing and
//! response-header construction.

mod body;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bridge_config::GatewayConfig;
use bridge_contracts::{Vfs, VfsError, VfsOptions};
use bridge_core::{ErrorNormalizer, ErrorNormalizerConfig};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use body::{drain_directory_json, stream_body, RequestBodyStream};

const MAX_STREAM_BYTES: u64 = 8 * 1024 * 1024;
const BUFFER_WRITE_THRESHOLD: u64 = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub vfs: Arc<dyn Vfs>,
    pub config: Arc<GatewayConfig>,
    pub errors: Arc<ErrorNormalizer>,
}

impl GatewayState {
    pub fn new(vfs: Arc<dyn Vfs>, config: GatewayConfig) -> Self {
        let errors = Arc::new(ErrorNormalizer::new(ErrorNormalizerConfig { enoent_as_200: config.enoent_as_200 }));
        Self { vfs, config: Arc::new(config), errors }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(any(handle)).with_state(state)
}

fn strip_mount<'a>(path: &'a str, mount: &str) -> Option<std::borrow::Cow<'a, str>> {
    if mount == "/" {
        return Some(std::borrow::Cow::Borrowed(path));
    }
    if path == mount.trim_end_matches('/') {
        return Some(std::borrow::Cow::Borrowed("/"));
    }
    path.strip_prefix(mount).map(|rest| std::borrow::Cow::Owned(format!("/{rest}")))
}

async fn handle(State(state): State<GatewayState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let Some(path) = strip_mount(parts.uri.path(), &state.config.mount) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let path = path.into_owned();

    let read_only_forward = state.config.read_only && parts.method != Method::GET && parts.method != Method::HEAD;
    if read_only_forward {
        return StatusCode::NOT_FOUND.into_response();
    }

    match parts.method.as_str() {
        "GET" | "HEAD" => handle_read(&state, &path, parts.method == Method::HEAD, &parts.headers).await,
        "PUT" => handle_put(&state, &path, &parts.headers, body).await,
        "DELETE" => handle_delete(&state, &path).await,
        "POST" => handle_post(&state, &path, &parts.headers, body).await,
        "PROPFIND" => handle_propfind(&state, &path).await,
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

fn error_response(state: &GatewayState, err: VfsError) -> Response {
    if state.errors.should_silence_log(&err) {
        debug!(error = %err, "vfs error");
    } else {
        warn!(error = %err, "vfs error");
    }
    let status = state.errors.status_for(&err);
    let body = format!("{}\n", err.message());
    (status, [(header::CONTENT_TYPE, "text/x-error")], body).into_response()
}

async fn handle_read(state: &GatewayState, path: &str, head: bool, headers: &HeaderMap) -> Response {
    let mut options = VfsOptions::new();
    if let Some(etag) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        options.insert("etag", etag.to_string());
    }
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        options.insert("range", range.to_string());
    }
    if let Some(if_range) = headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) {
        options.insert("ifRange", if_range.to_string());
    }
    if headers.contains_key("x-request-metadata") {
        options.insert("metadata", true);
    }

    let trailing_slash = path.ends_with('/') || path.is_empty();
    let mut directory_mode = trailing_slash;

    let result = if trailing_slash {
        match &state.config.auto_index {
            Some(index_name) => {
                let index_path = format!("{path}{index_name}");
                match state.vfs.readfile(&index_path, options.clone()).await {
                    Ok(meta) => {
                        directory_mode = false;
                        Ok(meta)
                    }
                    Err(_) => state.vfs.readdir(path, options).await,
                }
            }
            None => state.vfs.readdir(path, options).await,
        }
    } else {
        state.vfs.readfile(path, options).await
    };

    let meta = match result {
        Ok(meta) => meta,
        Err(err) => return error_response(state, err),
    };

    if let Some(message) = meta.range_not_satisfiable {
        if let Some(stream) = meta.stream {
            stream.destroy();
        }
        return (StatusCode::RANGE_NOT_SATISFIABLE, [(header::CONTENT_TYPE, "text/x-error")], message).into_response();
    }

    let mut response = Response::builder();
    if let Some(etag) = &meta.etag {
        response = response.header(header::ETAG, etag);
    }
    if meta.not_modified == Some(true) {
        if let Some(stream) = meta.stream {
            stream.destroy();
        }
        return response.status(StatusCode::NOT_MODIFIED).body(Body::empty()).expect("valid 304 response");
    }

    let status = if meta.partial_content.is_some() { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
    if let Some(partial) = &meta.partial_content {
        response = response.header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", partial.start, partial.end, partial.size));
    }

    if meta.stream.is_some() || head {
        if directory_mode {
            response = response.header(header::CONTENT_TYPE, "application/json");
        } else if let Some(mime) = &meta.mime {
            if state.config.no_mime {
                response = response.header(header::CONTENT_TYPE, "application/octet-stream").header("X-VFS-Content-Type", mime);
            } else {
                response = response.header(header::CONTENT_TYPE, mime);
            }
        } else if state.config.no_mime {
            response = response.header(header::CONTENT_TYPE, "application/octet-stream");
        }
        if let Some(metadata_len) = meta.metadata_string_length {
            let content_len = meta.size.unwrap_or(0);
            response = response
                .header(header::CONTENT_LENGTH, (content_len + metadata_len as u64).to_string())
                .header("X-Content-Length", content_len.to_string())
                .header("X-Metadata-Length", metadata_len.to_string());
        } else if let Some(size) = meta.size {
            response = response.header(header::CONTENT_LENGTH, size.to_string());
        }
    }

    let Some(stream) = meta.stream else {
        return response.status(status).body(Body::empty()).expect("valid empty response");
    };

    if let Some(size) = meta.size {
        if size > MAX_STREAM_BYTES {
            stream.destroy();
            let message = format!("File size is bigger than allowed (8MB). Size is {size} bytes\n");
            return Response::builder()
                .status(StatusCode::from_u16(513).expect("513 is a valid status code"))
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from(message))
                .expect("valid 513 response");
        }
    }

    if head {
        stream.destroy();
        return response.status(status).body(Body::empty()).expect("valid HEAD response");
    }

    if directory_mode {
        let body = drain_directory_json(stream).await;
        return response.status(status).body(Body::from(body)).expect("valid directory listing response");
    }

    response.status(status).body(stream_body(stream)).expect("valid streaming response")
}

async fn handle_put(state: &GatewayState, path: &str, headers: &HeaderMap, body: Body) -> Response {
    if path.ends_with('/') {
        return match state.vfs.mkdir_p(path, VfsOptions::new().with("parents", true)).await {
            Ok(_) => StatusCode::CREATED.into_response(),
            Err(err) => error_response(state, err),
        };
    }

    let content_length = headers.get(header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u64>().ok());
    let buffer_write = content_length.map(|len| len < BUFFER_WRITE_THRESHOLD).unwrap_or(false);

    let data_stream = body.into_data_stream();
    let stream = RequestBodyStream::spawn(data_stream);
    let options = VfsOptions::new().with("parents", true).with("bufferWrite", buffer_write).with_stream(stream);

    match state.vfs.mkfile(path, options).await {
        Ok(_) => StatusCode::CREATED.into_response(),
        Err(err) => error_response(state, err),
    }
}

async fn handle_delete(state: &GatewayState, path: &str) -> Response {
    let result = if path.ends_with('/') { state.vfs.rmdir(path, VfsOptions::new()).await } else { state.vfs.rmfile(path, VfsOptions::new()).await };
    match result {
        Ok(_) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], String::new()).into_response(),
        Err(err) => error_response(state, err),
    }
}

async fn handle_post(state: &GatewayState, path: &str, headers: &HeaderMap, body: Body) -> Response {
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");

    if path.ends_with('/') && content_type.starts_with("multipart/") {
        return match handle_multipart(state, path, content_type, body).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
    }

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => return GatewayError::bad_request(err.to_string()).into_response(),
    };

    let command: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => return GatewayError::bad_request(err.to_string()).into_response(),
    };

    let result = if let Some(from) = command.get("renameFrom").and_then(Value::as_str) {
        state.vfs.rename(path, VfsOptions::new().with("from", from)).await
    } else if let Some(from) = command.get("copyFrom").and_then(Value::as_str) {
        state.vfs.copy(path, VfsOptions::new().with("from", from)).await
    } else if let Some(target) = command.get("linkTo").and_then(Value::as_str) {
        state.vfs.symlink(path, VfsOptions::new().with("target", target)).await
    } else if let Some(metadata) = command.get("metadata") {
        state.vfs.metadata(path, VfsOptions::new().with("metadata", metadata.clone())).await
    } else {
        return GatewayError::internal("Invalid command").into_response();
    };

    match result {
        Ok(_) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], String::new()).into_response(),
        Err(err) => error_response(state, err),
    }
}

async fn handle_multipart(state: &GatewayState, path: &str, content_type: &str, body: Body) -> Result<Response, GatewayError> {
    let boundary = multer::parse_boundary(content_type).map_err(|err| GatewayError::bad_request(err.to_string()))?;
    let mut multipart = multer::Multipart::new(body.into_data_stream(), boundary);

    while let Some(field) = multipart.next_field().await? {
        let filename = field
            .file_name()
            .or_else(|| field.name())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::bad_request("multipart part missing name or filename"))?;

        let target = format!("{}/{filename}", path.trim_end_matches('/'));
        let stream = RequestBodyStream::spawn(field);
        state.vfs.mkfile(&target, VfsOptions::new().with_stream(stream)).await.map_err(|err| GatewayError::internal(err.message()))?;
    }

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], String::new()).into_response())
}

async fn handle_propfind(state: &GatewayState, path: &str) -> Response {
    match state.vfs.stat(path, VfsOptions::new()).await {
        Ok(meta) => {
            let body = Value::Object(meta.extra);
            (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], body.to_string()).into_response()
        }
        Err(err) => error_response(state, err),
    }
}
