//! Upload endpoint integration tests
//!
//! Drive the full router with hand-built multipart bodies. `/bin/sh` scripts
//! stand in for the classifier; the upload path arrives as `$1`.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use dfd_common::config::{ClassifierConfig, StorageNaming, VerdictMode};
use dfd_common::ServiceConfig;
use dfd_server::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "dfd-test-boundary";
const RESULT_TEMPLATE: &str = "{{ Result }}|{{ Confidence }}|{{ IsFake }}";

/// Config rooted in a fresh temp dir, with `script` as the classifier
fn test_config(dir: &Path, script: &str) -> ServiceConfig {
    let static_dir = dir.join("static");
    std::fs::create_dir_all(&static_dir).unwrap();
    std::fs::write(static_dir.join("index.html"), "<html><body>upload form</body></html>").unwrap();
    std::fs::write(static_dir.join("result.html"), RESULT_TEMPLATE).unwrap();

    ServiceConfig {
        uploads_dir: dir.join("uploads"),
        template_path: static_dir.join("result.html"),
        static_dir,
        classifier: ClassifierConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "classifier".to_string()],
            timeout: Duration::from_secs(10),
            max_concurrent: 4,
            admission_wait: Duration::from_secs(5),
            max_waiting: 16,
        },
        ..ServiceConfig::default()
    }
}

fn file_part(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    part.extend_from_slice(content);
    part.extend_from_slice(b"\r\n");
    part
}

fn text_part(field: &str, value: &str) -> Vec<u8> {
    format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n").into_bytes()
}

fn multipart_body(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut body = parts.concat();
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn video_upload(filename: &str, content: &[u8]) -> Request<Body> {
    upload_request(multipart_body(&[file_part("file", filename, content)]))
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Regular files currently in the uploads dir (empty if it does not exist)
fn stored_files(uploads_dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(uploads_dir) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.is_file())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn content_type(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|value| value.to_str().unwrap().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_real_token_renders_fake_sentence() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(content_type(&response).contains("text/html"));
    assert_eq!(
        body_text(response).await,
        "The video is classified as Fake|0.00|false"
    );
}

#[tokio::test]
async fn test_other_output_renders_real_sentence() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf synthetic_detected");
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "The video is classified as Real|0.00|true"
    );
}

#[tokio::test]
async fn test_trailing_newline_is_not_real() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "echo real");
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "The video is classified as Real|0.00|true"
    );
}

#[tokio::test]
async fn test_stderr_output_participates_in_verdict() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real >&2");
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "The video is classified as Fake|0.00|false"
    );
}

#[tokio::test]
async fn test_upload_is_stored_before_classification() {
    let dir = TempDir::new().unwrap();
    // Classifier answers `real` only if it can read the full payload
    let config = test_config(dir.path(), "test \"$(cat \"$1\")\" = payload && printf real");
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"payload")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("classified as Fake"));

    let files = stored_files(&uploads_dir);
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"payload");
    assert_eq!(files[0].extension().unwrap(), "mp4");
}

#[tokio::test]
async fn test_missing_file_part() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let body = multipart_body(&[text_part("comment", "no video attached")]);
    let response = app.oneshot(upload_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Error retrieving file");
    assert!(stored_files(&uploads_dir).is_empty());
}

#[tokio::test]
async fn test_file_field_without_filename() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let app = build_router(AppState::new(config));

    let body = multipart_body(&[text_part("file", "just text")]);
    let response = app.oneshot(upload_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Error retrieving file");
}

#[tokio::test]
async fn test_oversized_body_is_rejected_without_writing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let payload = vec![0u8; 12 * 1024 * 1024];
    let response = app.oneshot(video_upload("big.mp4", &payload)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Error parsing form");
    assert!(stored_files(&uploads_dir).is_empty());
}

#[tokio::test]
async fn test_non_multipart_body() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let app = build_router(AppState::new(config));

    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Error parsing form");
}

#[tokio::test]
async fn test_classifier_failure_exposes_output() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf 'model load failed'; exit 1");
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(content_type(&response).starts_with("text/plain"));
    let body = body_text(response).await;
    assert!(body.starts_with("Error processing video: "), "{body}");
    assert!(body.contains("model load failed"), "{body}");
}

#[tokio::test]
async fn test_uploads_directory_creation_failure() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    config.uploads_dir = blocker.join("uploads");
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Error creating uploads directory");
}

#[tokio::test]
async fn test_missing_template() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    config.template_path = dir.path().join("static").join("missing.html");
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Error loading template");
}

#[tokio::test]
async fn test_unsupported_file_type() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    config.allowed_extensions = vec!["mp4".to_string(), "avi".to_string(), "mov".to_string()];
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("notes.txt", b"text")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Unsupported file type");
    assert!(stored_files(&uploads_dir).is_empty());
}

#[tokio::test]
async fn test_declared_naming_overwrites_same_name() {
    let dir = TempDir::new().unwrap();
    // Echo the stored file back so the verdict reflects what the classifier saw
    let mut config = test_config(dir.path(), "cat \"$1\"");
    config.storage_naming = StorageNaming::Declared;
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let first = app
        .clone()
        .oneshot(video_upload("clip.mp4", b"first payload"))
        .await
        .unwrap();
    assert_eq!(
        body_text(first).await,
        "The video is classified as Real|0.00|true"
    );

    let second = app.oneshot(video_upload("clip.mp4", b"real")).await.unwrap();
    assert_eq!(
        body_text(second).await,
        "The video is classified as Fake|0.00|false"
    );

    let files = stored_files(&uploads_dir);
    assert_eq!(files, vec![uploads_dir.join("clip.mp4")]);
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"real");
}

#[tokio::test]
async fn test_declared_naming_strips_path_components() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    config.storage_naming = StorageNaming::Declared;
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let response = app
        .oneshot(video_upload("../../escape.mp4", b"video bytes"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(stored_files(&uploads_dir), vec![uploads_dir.join("escape.mp4")]);
    assert!(!dir.path().join("escape.mp4").exists());
}

#[tokio::test]
async fn test_unique_naming_keeps_same_name_uploads_apart() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    for payload in [&b"one"[..], &b"two"[..]] {
        let response = app
            .clone()
            .oneshot(video_upload("clip.mp4", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(stored_files(&uploads_dir).len(), 2);
}

#[tokio::test]
async fn test_uploads_discarded_when_not_kept() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    config.retention.keep_uploads = false;
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(stored_files(&uploads_dir).is_empty());
}

#[tokio::test]
async fn test_retention_limit_applies_after_store() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    config.retention.max_files = Some(1);
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(video_upload("clip.mp4", b"video bytes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(stored_files(&uploads_dir).len(), 1);
}

#[tokio::test]
async fn test_classifier_deadline() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "exec sleep 10");
    config.classifier.timeout = Duration::from_secs(1);
    let app = build_router(AppState::new(config));

    let started = std::time::Instant::now();
    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        body_text(response).await,
        "Error processing video: classifier timed out after 1s"
    );
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn test_busy_when_no_slot_available() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "sleep 1; printf real");
    config.classifier.max_concurrent = 1;
    config.classifier.admission_wait = Duration::ZERO;
    let uploads_dir = config.uploads_dir.clone();
    let app = build_router(AppState::new(config));

    let (first, second) = tokio::join!(
        app.clone().oneshot(video_upload("a.mp4", b"first")),
        app.oneshot(video_upload("b.mp4", b"second")),
    );

    let mut statuses = vec![first.unwrap().status(), second.unwrap().status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::SERVICE_UNAVAILABLE]);
    // The rejected request never reached storage
    assert_eq!(stored_files(&uploads_dir).len(), 1);
}

#[tokio::test]
async fn test_busy_message() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "sleep 1; printf real");
    config.classifier.max_concurrent = 1;
    config.classifier.admission_wait = Duration::ZERO;
    let state = AppState::new(config);
    let app = build_router(state.clone());

    let _held = state.pipeline.admission().acquire().await.unwrap();
    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "Server busy, try again later");
}

#[tokio::test]
async fn test_strict_mode_rejects_unrecognized_output() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf maybe");
    config.verdict_mode = VerdictMode::Strict;
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_text(response).await,
        "Error processing video: unrecognized classifier output"
    );
}

#[tokio::test]
async fn test_strict_mode_maps_tokens_directly() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "echo fake");
    config.verdict_mode = VerdictMode::Strict;
    let app = build_router(AppState::new(config));

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "The video is classified as Fake|0.00|true"
    );
}

#[tokio::test]
async fn test_health() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let app = build_router(AppState::new(config));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "dfd-server");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["classifications_in_flight"], 0);
    assert!(json["uptime_secs"].is_u64());
}

#[tokio::test]
async fn test_static_index_served_for_root() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let app = build_router(AppState::new(config));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(content_type(&response).contains("text/html"));
    assert!(body_text(response).await.contains("upload form"));
}

#[tokio::test]
async fn test_unknown_static_path_is_not_found() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let app = build_router(AppState::new(config));

    let response = app
        .oneshot(Request::builder().uri("/nope.css").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_preflight() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "printf real");
    let app = build_router(AppState::new(config));

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/upload")
        .header(header::ORIGIN, "http://example.test")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-requested-with")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap();
    assert!(methods.contains("POST"));
    let allowed = headers[header::ACCESS_CONTROL_ALLOW_HEADERS]
        .to_str()
        .unwrap()
        .to_ascii_lowercase();
    assert!(allowed.contains("x-requested-with"));
}

#[tokio::test]
async fn test_write_failure_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    config.storage_naming = StorageNaming::Declared;
    let uploads_dir = config.uploads_dir.clone();
    // A directory squatting on the target name makes file creation fail
    std::fs::create_dir_all(uploads_dir.join("clip.mp4")).unwrap();
    let state = AppState::new(config);
    let app = build_router(state.clone());

    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Error saving file");
    assert!(stored_files(&uploads_dir).is_empty());
    let entries: Vec<PathBuf> = std::fs::read_dir(&uploads_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(entries, vec![uploads_dir.join("clip.mp4")]);
    assert_eq!(state.pipeline.store().in_flight_count(), 0);
    assert_eq!(state.pipeline.admission().in_use(), 0);
}

#[tokio::test]
async fn test_client_disconnect_kills_classifier() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("classifier-finished");
    let script = format!("sleep 2; touch '{}'; printf real", marker.display());
    let config = test_config(dir.path(), &script);
    let state = AppState::new(config);
    let app = build_router(state.clone());

    // The client gives up while the classifier is still running
    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        app.oneshot(video_upload("clip.mp4", b"video bytes")),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(!marker.exists(), "classifier kept running after the request was dropped");
    assert_eq!(state.pipeline.admission().in_use(), 0);
    assert_eq!(state.pipeline.store().in_flight_count(), 0);
}

#[tokio::test]
async fn test_waiting_requests_are_capped() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "printf real");
    config.classifier.max_concurrent = 1;
    config.classifier.max_waiting = 0;
    config.classifier.admission_wait = Duration::from_secs(30);
    let state = AppState::new(config);
    let app = build_router(state.clone());

    let _held = state.pipeline.admission().acquire().await.unwrap();
    let started = std::time::Instant::now();
    let response = app.oneshot(video_upload("clip.mp4", b"video bytes")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "Server busy, try again later");
    assert!(started.elapsed() < Duration::from_secs(5));
}
