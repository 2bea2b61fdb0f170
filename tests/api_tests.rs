#![cfg(feature = "api")]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use yt_highlight_analyzer::api::{build_router, AppState};
use yt_highlight_analyzer::audio::{AudioDecoder, DecodedAudio};
use yt_highlight_analyzer::downloader::{AudioDownloader, DownloadProgress};
use yt_highlight_analyzer::{AnalysisService, ConfigBuilder, DownloadError};

struct WritingDownloader;

#[async_trait]
impl AudioDownloader for WritingDownloader {
    async fn download(
        &self,
        _url: &str,
        destination: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf, DownloadError> {
        tokio::fs::write(destination, b"fake mp3 payload")
            .await
            .map_err(|e| DownloadError::Failed(e.to_string()))?;
        progress(DownloadProgress::Finished);
        Ok(destination.to_path_buf())
    }
}

struct SilentDecoder;

#[async_trait]
impl AudioDecoder for SilentDecoder {
    async fn decode(&self, _path: &Path, sample_rate: u32) -> yt_highlight_analyzer::Result<DecodedAudio> {
        Ok(DecodedAudio::new(vec![0.0; sample_rate as usize * 10], sample_rate))
    }

    async fn probe_duration(&self, _path: &Path) -> yt_highlight_analyzer::Result<f64> {
        Ok(10.0)
    }
}

struct TestApp {
    router: Router,
    service: AnalysisService,
    _temp_dir: TempDir,
}

async fn create_test_app(retain_downloads: bool) -> TestApp {
    let temp_dir = TempDir::new().unwrap();
    let static_dir = temp_dir.path().join("static");
    std::fs::create_dir_all(&static_dir).unwrap();
    std::fs::write(static_dir.join("index.html"), "<html>highlights</html>").unwrap();

    let mut config = ConfigBuilder::new()
        .with_workers(1)
        .with_cache_dir(temp_dir.path().join("cache"))
        .with_download_dir(temp_dir.path().join("downloads"))
        .retain_downloads(retain_downloads)
        .build();
    config.server.static_dir = static_dir;

    let service = AnalysisService::new(&config, Arc::new(WritingDownloader), Arc::new(SilentDecoder));
    service.initialize(false).await.unwrap();

    let router = build_router(AppState::new(service.clone(), Arc::new(config)));
    TestApp {
        router,
        service,
        _temp_dir: temp_dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(router, request).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = create_test_app(false).await;

    for uri in ["/health", "/api/health"] {
        let (status, body) = send_json(&app.router, get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_jobs"], 0);
    }
}

#[tokio::test]
async fn test_process_requires_url() {
    let app = create_test_app(false).await;

    let (status, body) = send_json(&app.router, post_json("/api/process-youtube", "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, body) = send_json(&app.router, post_json("/api/process-youtube", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid JSON payload");
}

#[tokio::test]
async fn test_process_then_poll_until_complete() {
    let app = create_test_app(false).await;
    let request = r#"{"youtube_url": "https://www.youtube.com/watch?v=apiVideo001"}"#;

    let (status, body) = send_json(&app.router, post_json("/api/process-youtube", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processing");
    assert_eq!(body["cache_key"], "apiVideo001");

    app.service.wait_until_idle().await;

    let (status, body) = send_json(&app.router, get("/api/analysis-status?key=apiVideo001")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["cache_key"], "apiVideo001");
    assert_eq!(body["highlights"], serde_json::json!([]));

    // Cached now: the same request answers with the result itself
    let (_, body) = send_json(&app.router, post_json("/api/process-youtube", request)).await;
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn test_status_query_validation() {
    let app = create_test_app(false).await;

    let (status, _) = send_json(&app.router, get("/api/analysis-status")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(&app.router, get("/api/analysis-status?key=..%2Fetc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(
        &app.router,
        get("/api/analysis-status?youtube_url=https%3A%2F%2Fyoutu.be%2FneverSeen01"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "not_started");
    assert_eq!(body["cache_key"], "neverSeen01");
}

#[tokio::test]
async fn test_clear_cache_reports_warning_when_empty() {
    let app = create_test_app(false).await;

    let (status, body) = send_json(
        &app.router,
        post_json("/api/clear-cache", r#"{"youtube_url": "https://youtu.be/nothingHere"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "warning");
    assert_eq!(body["details"]["key"], "nothingHere");
    assert_eq!(body["details"]["job"], "not_found");
}

#[tokio::test]
async fn test_most_replayed_requires_video_id() {
    let app = create_test_app(false).await;

    let (status, _) = send_json(&app.router, get("/api/get-most-replayed")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(&app.router, get("/api/get-most-replayed?url=https%3A%2F%2Fexample.com%2F")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("video ID"));
}

#[tokio::test]
async fn test_download_serves_only_retained_audio() {
    let app = create_test_app(true).await;
    let (status, _) = send(&app.router, get("/download/missing01.mp3")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &app.router,
        post_json("/api/process-youtube", r#"{"youtube_url": "https://youtu.be/keptAudio01"}"#),
    )
    .await;
    app.service.wait_until_idle().await;

    let (status, bytes) = send(&app.router, get("/download/keptAudio01.mp3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"fake mp3 payload");

    let response = app.router.clone().oneshot(get("/download/keptAudio01.mp3")).await.unwrap();
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"keptAudio01.mp3\""
    );

    // Served from disk, so byte ranges work
    let ranged = Request::builder()
        .uri("/download/keptAudio01.mp3")
        .header(header::RANGE, "bytes=0-3")
        .body(Body::empty())
        .unwrap();
    let (status, bytes) = send(&app.router, ranged).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(bytes, b"fake");

    let not_retained = create_test_app(false).await;
    let (status, _) = send(&not_retained.router, get("/download/keptAudio01.mp3")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_paths_fall_back_to_index() {
    let app = create_test_app(false).await;

    let (status, bytes) = send(&app.router, get("/some/client/route")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"<html>highlights</html>");
}
