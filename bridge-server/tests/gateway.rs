//! HTTP gateway scenarios from `spec.md` §8 (S1-S5), exercised against a
//! real `LocalVfs` over a temp directory via `tower::ServiceExt::oneshot`
//! rather than a bound TCP listener.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use bridge_config::GatewayConfig;
use bridge_server::gateway::{router, GatewayState};
use bridge_server::LocalVfs;
use http_body_util::BodyExt;
use tower::ServiceExt;

fn mounted_state(root: &std::path::Path) -> GatewayState {
    let vfs = Arc::new(LocalVfs::new(root));
    GatewayState::new(vfs, GatewayConfig { mount: "/m/".to_string(), ..Default::default() })
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.expect("collect body").to_bytes()
}

#[tokio::test]
async fn s1_head_of_a_file_reports_size_and_mime_without_a_body() {
    let dir = tempfile::tempdir().expect("tempdir");
    let contents = "exactly-17-bytes!";
    assert_eq!(contents.len(), 17);
    std::fs::write(dir.path().join("foo.txt"), contents).expect("write fixture");

    let app = router(mounted_state(dir.path()));
    let request = Request::builder().method("HEAD").uri("/m/foo.txt").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "17");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn s2_directory_listing_without_auto_index_is_a_json_array() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("d")).expect("mkdir");
    std::fs::write(dir.path().join("d/a"), b"").expect("write a");
    std::fs::write(dir.path().join("d/b"), b"").expect("write b");

    let app = router(mounted_state(dir.path()));
    let request = Request::builder().method("GET").uri("/m/d/").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "application/json");
    let body = body_bytes(response).await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("valid json");
    let entries = parsed.as_array().expect("array body");
    assert_eq!(entries.len(), 2);
    let names: std::collections::BTreeSet<_> = entries.iter().filter_map(|e| e.get("name")?.as_str()).collect();
    assert_eq!(names, std::collections::BTreeSet::from(["a", "b"]));
    assert!(body.starts_with(b"[\n  "));
    assert!(body.ends_with(b"\n]"));
}

#[tokio::test]
async fn s2_empty_directory_listing_is_the_empty_array() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("empty")).expect("mkdir");

    let app = router(mounted_state(dir.path()));
    let request = Request::builder().method("GET").uri("/m/empty/").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.as_ref(), b"[]");
}

#[tokio::test]
async fn s3_range_hit_returns_partial_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let contents: Vec<u8> = (0..100u8).collect();
    std::fs::write(dir.path().join("f"), &contents).expect("write fixture");

    let app = router(mounted_state(dir.path()));
    let request = Request::builder()
        .method("GET")
        .uri("/m/f")
        .header(header::RANGE, "bytes=10-19")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers().get(header::CONTENT_RANGE).unwrap(), "bytes 10-19/100");
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "10");
    let body = body_bytes(response).await;
    assert_eq!(body.as_ref(), &contents[10..20]);
}

#[tokio::test]
async fn s4_oversized_file_is_rejected_with_513() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("huge");
    let file = std::fs::File::create(&path).expect("create");
    let size = 9 * 1024 * 1024u64;
    file.set_len(size).expect("set_len");

    let app = router(mounted_state(dir.path()));
    let request = Request::builder().method("GET").uri("/m/huge").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status().as_u16(), 513);
    let body = body_bytes(response).await;
    assert_eq!(body.as_ref(), format!("File size is bigger than allowed (8MB). Size is {size} bytes\n").as_bytes());
}

#[tokio::test]
async fn s5_post_rename_moves_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("b"), b"payload").expect("write fixture");

    let app = router(mounted_state(dir.path()));
    let request = Request::builder()
        .method("POST")
        .uri("/m/a")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"renameFrom":"/b"}"#))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
    assert!(body_bytes(response).await.is_empty());

    assert!(dir.path().join("a").exists());
    assert!(!dir.path().join("b").exists());
    assert_eq!(std::fs::read(dir.path().join("a")).expect("read renamed"), b"payload");
}
