//! Error types for the highlight analyzer

use thiserror::Error;

/// Result type for analyzer operations
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Audio decoding failed: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Heatmap extraction failed: {0}")]
    Heatmap(#[from] HeatmapError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Analysis service is shutting down")]
    ShuttingDown,
}

/// Failures while acquiring audio from the external download tool.
///
/// Each variant knows whether resubmitting the same URL later has a
/// reasonable chance of succeeding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DownloadError {
    #[error("Too Many Requests (429). The server is being rate-limited.")]
    RateLimited,

    #[error("This video is age-restricted and requires a valid login cookie.")]
    AgeRestricted,

    #[error("This video is private.")]
    Private,

    #[error("Video unavailable: {0}")]
    Unavailable(String),

    #[error("Download tool not found: {0}")]
    ToolMissing(String),

    #[error("Download timed out after {0}s")]
    TimedOut(u64),

    #[error("Post-processed audio file not found: {0}")]
    MissingOutput(String),

    #[error("{0}")]
    Failed(String),
}

impl DownloadError {
    /// Whether a later resubmission may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::RateLimited
            | DownloadError::TimedOut(_)
            | DownloadError::MissingOutput(_)
            | DownloadError::Failed(_) => true,
            DownloadError::AgeRestricted
            | DownloadError::Private
            | DownloadError::Unavailable(_)
            | DownloadError::ToolMissing(_) => false,
        }
    }

    /// Classify the diagnostic output of a failed download tool run
    pub fn classify(output: &str) -> Self {
        let lower = output.to_lowercase();

        if lower.contains("http error 429") || lower.contains("too many requests") {
            DownloadError::RateLimited
        } else if lower.contains("confirm your age") || lower.contains("age-restricted") {
            DownloadError::AgeRestricted
        } else if lower.contains("private video") {
            DownloadError::Private
        } else if lower.contains("video unavailable") || lower.contains("this video has been removed") {
            DownloadError::Unavailable(last_error_line(output))
        } else {
            DownloadError::Failed(last_error_line(output))
        }
    }
}

/// Pick the most useful line out of a tool's stderr
fn last_error_line(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| output.lines().rev().map(str::trim).find(|line| !line.is_empty()))
        .unwrap_or("unknown download error")
        .to_string()
}

/// Failures of the best-effort Most Replayed scraper
#[derive(Error, Debug)]
pub enum HeatmapError {
    #[error("Request failed for {url}: {message}")]
    Request { url: String, message: String },

    #[error("Request timed out for {0}")]
    Timeout(String),

    #[error("Could not find ytInitialData in the page.")]
    MissingInitialData,

    #[error("Failed to parse JSON from page: {0}")]
    InvalidJson(String),

    #[error("Heatmap data not found in any expected structure.")]
    NotFound,

    #[error("Heatmap data found, but key details are missing.")]
    Incomplete,
}
