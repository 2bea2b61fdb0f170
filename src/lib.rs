//! YouTube Highlight Analyzer
//!
//! Finds highlight timestamps in a video's audio track by short-time energy
//! analysis, caches results per video, and runs analyses in a bounded
//! background worker pool with single-flight de-duplication per video.
//! Also scrapes YouTube's own "Most replayed" heatmap on a best-effort basis.

pub mod analysis;
pub mod audio;
pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod heatmap;
pub mod models;
pub mod orchestrator;
pub mod registry;

#[cfg(feature = "api")]
pub mod api;

// Re-export main types for easy access
pub use crate::analysis::{DetectionOutcome, HighlightDetector};
pub use crate::audio::{AudioDecoder, FfmpegDecoder};
pub use crate::cache::{CacheStore, ReconcileReport};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::downloader::{AudioDownloader, DownloadProgress, YtDlpDownloader};
pub use crate::error::{AnalyzerError, DownloadError, HeatmapError, Result};
pub use crate::heatmap::{HeatmapData, HeatmapScraper};
pub use crate::models::{AnalysisResult, AnalysisStatus, CacheKey, HighlightSource};
pub use crate::orchestrator::{AnalysisService, ClearOutcome, StatusReport, SubmitOutcome};
pub use crate::registry::{CancelOutcome, JobRegistry, JobStage};
