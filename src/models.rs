//! Core data model: cache keys and analysis results

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Canonical identity of a video, used as the cache and registry key.
///
/// The YouTube video id when one can be extracted from the URL, otherwise
/// the hex MD5 digest of the raw URL string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

fn video_id_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?:youtube\.com/watch\?(?:.*&)?v=|youtu\.be/)([\w-]+)",
            r"youtube\.com/shorts/([\w-]+)",
            r"youtube\.com/(?:embed|live)/([\w-]+)",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Extract the YouTube video id from a URL, if it matches a known shape
pub fn extract_video_id(url: &str) -> Option<String> {
    let trimmed = url.trim();

    // Structured parse first: handles query parameters in any order
    if let Ok(parsed) = url::Url::parse(trimmed) {
        let host = parsed.host_str().unwrap_or_default().trim_start_matches("www.").trim_start_matches("m.");
        if host == "youtube.com" || host == "music.youtube.com" {
            if parsed.path() == "/watch" {
                if let Some((_, id)) = parsed.query_pairs().find(|(k, _)| k == "v") {
                    if is_valid_video_id(&id) {
                        return Some(id.into_owned());
                    }
                }
            }
        }
    }

    video_id_patterns()
        .iter()
        .find_map(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| is_valid_video_id(id))
}

fn is_valid_video_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl CacheKey {
    /// Derive the key for a video URL
    pub fn from_url(url: &str) -> Self {
        match extract_video_id(url) {
            Some(video_id) => CacheKey(video_id),
            None => CacheKey(format!("{:x}", md5::compute(url.as_bytes()))),
        }
    }

    /// Accept an already-derived key (e.g. from a status query).
    ///
    /// Returns `None` for anything that could escape the cache directory.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if is_valid_video_id(raw) && raw.len() <= 128 {
            Some(CacheKey(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Success,
    Error,
    Processing,
}

/// Whether highlights came from real detection or were synthesized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightSource {
    Primary,
    Fallback,
}

/// Which strategy produced the highlight list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Percentile,
    PeakSearch,
    EvenlySpaced,
}

/// Result of analysing one video, persisted as the cache value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub status: AnalysisStatus,
    #[serde(default)]
    pub highlights: Vec<f64>,
    #[serde(default)]
    pub message: String,
    /// Unix timestamp (seconds) at which the result was produced
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<CacheKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<HighlightSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<DetectionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
}

/// Current wall clock as fractional unix seconds
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl AnalysisResult {
    /// Successful analysis (highlights may be empty)
    pub fn success(key: &CacheKey, highlights: Vec<f64>, source: HighlightSource, message: impl Into<String>) -> Self {
        Self {
            status: AnalysisStatus::Success,
            highlights,
            message: message.into(),
            timestamp: unix_timestamp(),
            cache_key: Some(key.clone()),
            source: Some(source),
            method: None,
            retryable: None,
            duration_seconds: None,
            processing_time: None,
        }
    }

    /// Failed analysis
    pub fn error(key: &CacheKey, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: AnalysisStatus::Error,
            highlights: Vec::new(),
            message: message.into(),
            timestamp: unix_timestamp(),
            cache_key: Some(key.clone()),
            source: None,
            method: None,
            retryable: Some(retryable),
            duration_seconds: None,
            processing_time: None,
        }
    }

    pub fn with_method(mut self, method: Option<DetectionMethod>) -> Self {
        self.method = method;
        self
    }

    pub fn with_duration(mut self, duration_seconds: Option<f64>) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time = Some((seconds * 100.0).round() / 100.0);
        self
    }

    /// Success and Error are terminal; Processing never is
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AnalysisStatus::Success | AnalysisStatus::Error)
    }

    /// An error that a fresh submit should re-attempt instead of serving from cache
    pub fn is_retryable_error(&self) -> bool {
        self.status == AnalysisStatus::Error && self.retryable.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_from_watch_url() {
        let key = CacheKey::from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(key.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_cache_key_same_video_different_shapes() {
        let urls = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s",
            "https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ?si=abc",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
        ];
        for url in urls {
            assert_eq!(CacheKey::from_url(url).as_str(), "dQw4w9WgXcQ", "url: {}", url);
        }
    }

    #[test]
    fn test_cache_key_shorts() {
        let key = CacheKey::from_url("https://www.youtube.com/shorts/abc_DEF-123");
        assert_eq!(key.as_str(), "abc_DEF-123");
    }

    #[test]
    fn test_cache_key_hash_fallback_is_deterministic() {
        let a = CacheKey::from_url("https://vimeo.com/123456");
        let b = CacheKey::from_url("https://vimeo.com/123456");
        let c = CacheKey::from_url("https://vimeo.com/654321");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cache_key_parse_rejects_path_traversal() {
        assert!(CacheKey::parse("../etc/passwd").is_none());
        assert!(CacheKey::parse("").is_none());
        assert_eq!(CacheKey::parse(" abc123 ").map(|k| k.to_string()), Some("abc123".to_string()));
    }

    #[test]
    fn test_result_json_shape() {
        let key = CacheKey::from_url("https://youtu.be/abc");
        let result = AnalysisResult::success(&key, vec![1.5, 9.0], HighlightSource::Primary, "ok")
            .with_method(Some(DetectionMethod::Percentile));
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["status"], "success");
        assert_eq!(value["source"], "primary");
        assert_eq!(value["method"], "percentile");
        assert_eq!(value["cache_key"], "abc");
        assert!(value.get("retryable").is_none());
    }

    #[test]
    fn test_result_reads_minimal_legacy_entry() {
        let json = r#"{"status":"error","message":"boom","timestamp":1.0,"extra":"ignored"}"#;
        let result: AnalysisResult = serde_json::from_str(json).unwrap();
        assert!(result.is_terminal());
        assert!(result.highlights.is_empty());
        // Errors without a retry tag are treated as retryable
        assert!(result.is_retryable_error());
    }
}
