//! API request handlers

use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{debug, info};

use super::models::{ApiError, ApiResult, ClearRequest, HeatmapQuery, ProcessRequest, StatusQuery};
use crate::cache::CacheStore;
use crate::error::HeatmapError;
use crate::heatmap::HeatmapScraper;
use crate::models::{extract_video_id, AnalysisResult, CacheKey};
use crate::orchestrator::{AnalysisService, StatusReport, SubmitOutcome};

/// Handle health check requests
pub fn health_check(service: &AnalysisService) -> Value {
    json!({
        "status": "ok",
        "service": "yt-highlight-analyzer",
        "version": env!("CARGO_PKG_VERSION"),
        "active_jobs": service.registry().active_count(),
        "max_workers": service.max_workers(),
        "shutting_down": service.is_shutting_down(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })
}

/// Serialize a cached result, making sure the key is present
fn result_json(result: &AnalysisResult, key: &CacheKey) -> ApiResult<Value> {
    let mut value = serde_json::to_value(result).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(object) = value.as_object_mut() {
        object.entry("cache_key").or_insert_with(|| json!(key));
    }
    Ok(value)
}

/// Handle `POST /api/process-youtube`
pub async fn process_youtube(service: &AnalysisService, request: ProcessRequest) -> ApiResult<Value> {
    let url = request
        .youtube_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("youtube_url is required"))?;

    info!("📨 Process request for {} (force_fresh: {})", url, request.force_fresh);

    match service.submit(url, request.force_fresh).await? {
        SubmitOutcome::Cached(result) => result_json(&result, &CacheKey::from_url(url)),
        SubmitOutcome::Processing { key, message } => Ok(json!({
            "status": "processing",
            "cache_key": key,
            "message": message
        })),
    }
}

/// Handle `GET /api/analysis-status`
pub async fn analysis_status(service: &AnalysisService, query: StatusQuery) -> ApiResult<Value> {
    let key = match (query.key.as_deref(), query.youtube_url.as_deref()) {
        (Some(raw), _) if !raw.trim().is_empty() => {
            CacheKey::parse(raw).ok_or_else(|| ApiError::bad_request("Invalid analysis key."))?
        }
        (_, Some(url)) if !url.trim().is_empty() => CacheKey::from_url(url.trim()),
        _ => return Err(ApiError::bad_request("Either key or youtube_url is required")),
    };

    debug!("Status poll for {}", key);
    match service.status(&key).await {
        StatusReport::Completed(result) => result_json(&result, &key),
        StatusReport::Processing(progress) => Ok(json!({
            "status": "processing",
            "cache_key": key,
            "stage": progress.stage,
            "message": progress.message
        })),
        StatusReport::NotStarted => Ok(json!({
            "status": "not_started",
            "cache_key": key,
            "message": "No analysis has been started for this video."
        })),
    }
}

/// Handle `POST /api/clear-cache`
pub async fn clear_cache(service: &AnalysisService, request: ClearRequest) -> ApiResult<Value> {
    let url = request
        .youtube_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("youtube_url is required"))?;

    let outcome = service.clear(url).await?;
    Ok(json!({
        "status": outcome.status,
        "message": outcome.message,
        "details": {
            "key": outcome.key,
            "cache_cleared": outcome.cache_cleared,
            "audio_deleted": outcome.audio_deleted,
            "job": outcome.job
        }
    }))
}

/// Handle `GET /api/get-most-replayed`
pub async fn most_replayed(scraper: &HeatmapScraper, query: HeatmapQuery) -> ApiResult<Value> {
    let url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("YouTube URL is required."))?;

    let video_id = extract_video_id(url).ok_or_else(|| {
        ApiError::bad_request("Could not extract a valid video ID from the URL for Most Replayed data.")
    })?;

    match scraper.fetch(&video_id).await {
        Ok(data) => Ok(json!({
            "status": "success",
            "video_id": data.video_id,
            "most_replayed_label": data.most_replayed_label,
            "most_replayed_label_marker_data": data.most_replayed_label_marker_data,
            "highest_intensity_marker_data": data.highest_intensity_marker_data,
            "marker_count": data.marker_count,
            "strategy": data.strategy
        })),
        Err(e @ HeatmapError::NotFound) => Err(ApiError::not_found(e.to_string())),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

/// Resolve a retained audio artifact for `GET /download/:filename`
pub fn download_path(cache: &CacheStore, retain_downloads: bool, filename: &str) -> ApiResult<PathBuf> {
    if !retain_downloads {
        return Err(ApiError::not_found("Downloads are not retained on this server."));
    }

    // Only `<key>.mp3` names are served, which rules out path traversal
    let key = filename
        .strip_suffix(".mp3")
        .and_then(CacheKey::parse)
        .ok_or_else(|| ApiError::not_found("File not found."))?;

    let path = cache.audio_path(&key);
    if !path.is_file() {
        return Err(ApiError::not_found("File not found."));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_download_path_requires_retention() {
        let temp_dir = TempDir::new().unwrap();
        let cache = CacheStore::new(temp_dir.path().join("c"), temp_dir.path());
        std::fs::write(temp_dir.path().join("abc.mp3"), b"mp3").unwrap();

        assert!(matches!(download_path(&cache, false, "abc.mp3"), Err(ApiError::NotFound(_))));
        assert_eq!(download_path(&cache, true, "abc.mp3").unwrap(), temp_dir.path().join("abc.mp3"));
    }

    #[test]
    fn test_download_path_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let cache = CacheStore::new(temp_dir.path().join("c"), temp_dir.path());

        for name in ["../secret.mp3", "abc.json", "missing.mp3", ".mp3"] {
            assert!(download_path(&cache, true, name).is_err(), "{}", name);
        }
    }
}
