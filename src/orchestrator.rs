//! Analysis orchestration: cache lookup, single-flight job dispatch and the
//! background worker that downloads, analyses and caches a video.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::analysis::{synthesize_fallback, DetectionOutcome, HighlightDetector};
use crate::audio::{AudioDecoder, FfmpegDecoder};
use crate::cache::{CacheStore, ReconcileReport};
use crate::config::{Config, DetectionConfig};
use crate::downloader::{AudioDownloader, DownloadProgress, YtDlpDownloader};
use crate::error::{AnalyzerError, Result};
use crate::models::{AnalysisResult, CacheKey, DetectionMethod, HighlightSource};
use crate::registry::{BeginOutcome, CancelOutcome, JobHandle, JobProgress, JobRegistry, JobStage, KeyLocks};

/// Answer to a submit request
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A terminal result was already cached
    Cached(AnalysisResult),
    /// A job is running (or was just started) for this key
    Processing { key: CacheKey, message: String },
}

/// Answer to a status poll
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    Completed(AnalysisResult),
    Processing(JobProgress),
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearStatus {
    Success,
    Warning,
}

/// What a clear request removed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClearOutcome {
    pub status: ClearStatus,
    pub message: String,
    pub key: CacheKey,
    pub cache_cleared: bool,
    pub audio_deleted: bool,
    pub job: CancelOutcome,
}

struct ServiceInner {
    cache: CacheStore,
    registry: JobRegistry,
    key_locks: KeyLocks,
    downloader: Arc<dyn AudioDownloader>,
    detector: HighlightDetector,
    worker_semaphore: Semaphore,
    max_workers: usize,
    retain_downloads: bool,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Owns the cache, the job registry and the worker pool.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct AnalysisService {
    inner: Arc<ServiceInner>,
}

impl AnalysisService {
    /// Build a service with explicit download and decode collaborators
    pub fn new(config: &Config, downloader: Arc<dyn AudioDownloader>, decoder: Arc<dyn AudioDecoder>) -> Self {
        let max_workers = config.performance.max_workers.max(1);
        info!("🔧 Initializing AnalysisService with {} workers", max_workers);

        Self {
            inner: Arc::new(ServiceInner {
                cache: CacheStore::new(&config.storage.cache_dir, &config.storage.download_dir),
                registry: JobRegistry::new(),
                key_locks: KeyLocks::new(),
                downloader,
                detector: HighlightDetector::new(config.detection.clone(), decoder),
                worker_semaphore: Semaphore::new(max_workers),
                max_workers,
                retain_downloads: config.storage.retain_downloads,
                shutting_down: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Build a service backed by yt-dlp and ffmpeg
    pub fn from_config(config: &Config) -> Self {
        let downloader = Arc::new(YtDlpDownloader::new(config.download.clone()));
        let decoder = Arc::new(FfmpegDecoder::new(
            config.download.ffmpeg_binary.clone(),
            config.download.ffprobe_binary.clone(),
        ));
        Self::new(config, downloader, decoder)
    }

    /// Create storage directories and optionally reconcile them.
    ///
    /// Must run before the first submission.
    pub async fn initialize(&self, reconcile: bool) -> Result<Option<ReconcileReport>> {
        self.inner.cache.initialize().await?;
        if !reconcile {
            return Ok(None);
        }
        let report = self.inner.cache.reconcile(self.inner.retain_downloads).await?;
        Ok(Some(report))
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn detection_config(&self) -> &DetectionConfig {
        self.inner.detector.config()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn retain_downloads(&self) -> bool {
        self.inner.retain_downloads
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of spawned workers that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Submit a URL for analysis. Never waits for the analysis itself.
    pub async fn submit(&self, url: &str, force_fresh: bool) -> Result<SubmitOutcome> {
        if self.is_shutting_down() {
            return Err(AnalyzerError::ShuttingDown);
        }

        let url = url.trim();
        if url.is_empty() {
            return Err(AnalyzerError::InvalidRequest("youtube_url is required".to_string()));
        }

        let key = CacheKey::from_url(url);
        let inner = &self.inner;

        if !force_fresh {
            if let Some(cached) = inner.cache.get(&key).await {
                if !cached.is_retryable_error() {
                    debug!("📚 Serving cached result for {}", key);
                    return Ok(SubmitOutcome::Cached(cached));
                }
                info!("🔄 Retrying previously failed analysis for {}", key);
                inner.cache.invalidate(&key).await?;
            }
        }

        if inner.registry.is_active(&key) {
            return Ok(processing(key, "Analysis already in progress."));
        }

        if force_fresh && inner.cache.invalidate(&key).await? {
            info!("🗑️ Forced fresh analysis for {}", key);
        }

        let handle = match inner.registry.try_begin(&key) {
            BeginOutcome::AlreadyRunning(_) => return Ok(processing(key, "Analysis already in progress.")),
            BeginOutcome::Started(handle) => handle,
        };

        // A job may have finished between the cache check and registration
        if !force_fresh {
            if let Some(cached) = inner.cache.get(&key).await {
                if !cached.is_retryable_error() {
                    inner.registry.complete(&key, handle.job_id());
                    debug!("📚 Serving result cached while registering {}", key);
                    return Ok(SubmitOutcome::Cached(cached));
                }
            }
        }

        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let worker = self.inner.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            run_job(&worker, handle, url).await;
            worker.in_flight.fetch_sub(1, Ordering::SeqCst);
            worker.idle.notify_waiters();
        });

        info!("🚀 Analysis queued for {}", key);
        Ok(processing(key, "Analysis started."))
    }

    /// Current state of the analysis for `key`
    pub async fn status(&self, key: &CacheKey) -> StatusReport {
        if let Some(result) = self.inner.cache.get(key).await {
            if result.is_terminal() {
                return StatusReport::Completed(result);
            }
        }

        match self.inner.registry.get(key) {
            Some(handle) => StatusReport::Processing(handle.progress()),
            None => StatusReport::NotStarted,
        }
    }

    /// Remove everything known about a URL. Safe to repeat.
    pub async fn clear(&self, url: &str) -> Result<ClearOutcome> {
        let key = CacheKey::from_url(url.trim());
        let inner = &self.inner;

        let cache_cleared = inner.cache.invalidate(&key).await?;
        let audio_deleted = inner.cache.delete_audio(&key).await?;
        let job = inner.registry.cancel(&key);

        let mut messages = Vec::new();
        if cache_cleared {
            messages.push("JSON cache cleared.");
        }
        if audio_deleted {
            messages.push("MP3 file deleted.");
        }
        match job {
            CancelOutcome::Cancelled => messages.push("Queued analysis cancelled."),
            CancelOutcome::Detached => messages.push("Running analysis detached."),
            CancelOutcome::NotFound => {}
        }

        let outcome = if messages.is_empty() {
            ClearOutcome {
                status: ClearStatus::Warning,
                message: "No cache, MP3 file, or running task found for this URL.".to_string(),
                key,
                cache_cleared,
                audio_deleted,
                job,
            }
        } else {
            info!("🧹 Cleared {}: {}", key, messages.join(" "));
            ClearOutcome {
                status: ClearStatus::Success,
                message: messages.join(" "),
                key,
                cache_cleared,
                audio_deleted,
                job,
            }
        };
        Ok(outcome)
    }

    /// Wait until every spawned worker has finished
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting submissions and drain queued and running jobs
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Shutting down analysis service ({} jobs in flight)", self.in_flight());
        self.wait_until_idle().await;
        self.inner.worker_semaphore.close();
        info!("✅ Analysis service stopped");
    }
}

fn processing(key: CacheKey, message: &str) -> SubmitOutcome {
    SubmitOutcome::Processing {
        key,
        message: message.to_string(),
    }
}

/// Worker boundary: every path ends with the registry entry completed
async fn run_job(inner: &ServiceInner, handle: Arc<JobHandle>, url: String) {
    let key = handle.key().clone();
    let _key_lock = inner.key_locks.acquire(&key).await;

    let _permit = match inner.worker_semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Worker pool closed before {} could start", key);
            inner.registry.complete(&key, handle.job_id());
            return;
        }
    };

    if !handle.mark_started() {
        debug!("Job {} for {} was cancelled while queued", handle.job_id(), key);
        inner.registry.complete(&key, handle.job_id());
        return;
    }

    let start_time = Instant::now();
    let result = match AssertUnwindSafe(execute(inner, &handle, &url)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("💥 Worker for {} panicked: {}", key, message);
            AnalysisResult::error(&key, format!("Internal error during analysis: {}", message), true)
        }
    };
    let result = result.with_processing_time(start_time.elapsed().as_secs_f64());

    // A detached job still caches its result unless a newer job owns the key
    let superseded = handle.is_cancelled() && inner.registry.is_active(&key);
    if superseded {
        info!("🗑️ Discarding result of detached job {} for {}", handle.job_id(), key);
    } else if let Err(e) = inner.cache.put(&key, &result).await {
        error!("❌ Failed to cache result for {}: {}", key, e);
    }

    if !inner.retain_downloads {
        if let Err(e) = inner.cache.delete_audio(&key).await {
            warn!("Failed to remove audio for {}: {}", key, e);
        }
    }

    inner.registry.complete(&key, handle.job_id());
    info!(
        "🏁 Job {} for {} finished with {:?} in {:.2}s",
        handle.job_id(),
        key,
        result.status,
        start_time.elapsed().as_secs_f64()
    );
}

/// Download, detect and build the result to cache
async fn execute(inner: &ServiceInner, handle: &JobHandle, url: &str) -> AnalysisResult {
    let key = handle.key();
    let audio_path = inner.cache.audio_path(key);

    handle.set_progress(JobStage::DownloadStart, "Starting audio download...");
    let sink = |update: DownloadProgress| match update {
        DownloadProgress::Downloading { message, .. } => handle.set_progress(JobStage::Downloading, message),
        DownloadProgress::Finished => {
            handle.set_progress(JobStage::DownloadComplete, "Download finished, preparing for analysis...")
        }
    };

    let audio_path = match inner.downloader.download(url, &audio_path, &sink).await {
        Ok(path) => path,
        Err(e) => {
            error!("❌ Download failed for {}: {}", key, e);
            return AnalysisResult::error(key, e.to_string(), e.is_retryable());
        }
    };

    handle.set_progress(JobStage::AnalysisStart, "Analyzing audio for highlights...");
    let config = inner.detector.config();

    match inner.detector.analyze(&audio_path).await {
        DetectionOutcome::Detected {
            highlights,
            method,
            duration,
        } => {
            let message = format!("Found {} highlights.", highlights.len());
            AnalysisResult::success(key, highlights, HighlightSource::Primary, message)
                .with_method(Some(method))
                .with_duration(Some(duration))
        }
        DetectionOutcome::NoHighlights { duration } => {
            match evenly_spaced(config, duration, "No distinct highlights found") {
                Some(fallback) => {
                    info!("📐 No distinct peaks for {}, using evenly spaced points", key);
                    fallback.into_result(key)
                }
                None => AnalysisResult::success(key, Vec::new(), HighlightSource::Primary, "No highlights found.")
                    .with_duration(Some(duration)),
            }
        }
        DetectionOutcome::Undecodable(reason) => {
            warn!("⚠️ Audio for {} could not be analyzed: {}", key, reason);
            let context = format!("Audio could not be analyzed: {}", reason);
            let duration = inner.detector.probe_duration(&audio_path).await;

            match duration.and_then(|duration| evenly_spaced(config, duration, &context)) {
                Some(fallback) => {
                    info!("📐 Using evenly spaced points for undecodable audio of {}", key);
                    fallback.into_result(key)
                }
                None => AnalysisResult::success(key, Vec::new(), HighlightSource::Primary, context)
                    .with_duration(duration),
            }
        }
    }
}

/// Evenly spaced stand-in highlights for audio with a known length
struct Fallback {
    highlights: Vec<f64>,
    duration: f64,
    message: String,
}

impl Fallback {
    fn into_result(self, key: &CacheKey) -> AnalysisResult {
        AnalysisResult::success(key, self.highlights, HighlightSource::Fallback, self.message)
            .with_method(Some(DetectionMethod::EvenlySpaced))
            .with_duration(Some(self.duration))
    }
}

fn evenly_spaced(config: &DetectionConfig, duration: f64, context: &str) -> Option<Fallback> {
    if !config.synthesize_fallback || duration <= config.fallback_min_duration_seconds {
        return None;
    }

    let highlights = synthesize_fallback(duration, config.fallback_count, config.min_spacing_seconds);
    if highlights.is_empty() {
        return None;
    }
    let message = format!("{}; using {} evenly spaced points.", context, highlights.len());
    Some(Fallback {
        highlights,
        duration,
        message,
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
