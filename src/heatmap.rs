//! Best-effort scraper for YouTube's "Most replayed" heatmap
//!
//! The watch page embeds a large `ytInitialData` JSON object. Its layout
//! changes without notice, so extraction runs an ordered list of
//! independent strategies and the first one that yields markers wins.

use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::HeatmapConfig;
use crate::error::HeatmapError;

/// Duration assigned to the synthetic marker built from the label
const LABEL_MARKER_DURATION_MS: &str = "5000";
/// Intensity assigned to the synthetic marker built from the label
const LABEL_MARKER_INTENSITY: &str = "0.9";

/// One heatmap segment in the shape the frontend consumes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatMarker {
    #[serde(rename = "startMillis")]
    pub start_millis: String,
    #[serde(rename = "durationMillis")]
    pub duration_millis: String,
    #[serde(rename = "intensityScoreNormalized")]
    pub intensity_score_normalized: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_duration: Option<String>,
}

/// The "Most replayed" decoration shown on the player bar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MostReplayedLabel {
    pub label_text: String,
    pub decoration_time_millis: String,
    pub formatted_time: String,
}

/// Extracted heatmap summary for one video
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapData {
    pub video_id: String,
    pub most_replayed_label: Option<MostReplayedLabel>,
    pub most_replayed_label_marker_data: Option<HeatMarker>,
    pub highest_intensity_marker_data: Option<HeatMarker>,
    pub marker_count: usize,
    pub strategy: &'static str,
}

/// Markers and label as found in the page, before validation
#[derive(Debug, Clone, Default)]
pub struct RawHeatmap {
    pub markers: Vec<Value>,
    pub label: Option<(String, u64)>,
}

/// One way of locating heatmap data inside `ytInitialData`
pub trait HeatmapStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return the markers found by this strategy, or `None` if it found none
    fn extract(&self, initial_data: &Value) -> Option<RawHeatmap>;
}

/// `playerOverlays → … → markersMap → heatmapRenderer`
pub struct PlayerOverlayStrategy;

impl HeatmapStrategy for PlayerOverlayStrategy {
    fn name(&self) -> &'static str {
        "player_overlays"
    }

    fn extract(&self, initial_data: &Value) -> Option<RawHeatmap> {
        let markers_map = initial_data
            .pointer("/playerOverlays/playerOverlayRenderer/decoratedPlayerBarRenderer/decoratedPlayerBarRenderer/playerBar/multiMarkersPlayerBarRenderer/markersMap")?
            .as_array()?;
        debug!("Found markersMap with {} items", markers_map.len());

        for item in markers_map {
            let Some(renderer) = item.pointer("/value/heatmap/heatmapRenderer") else {
                continue;
            };
            let markers = renderer
                .get("heatMarkers")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if markers.is_empty() {
                continue;
            }

            let label = renderer
                .get("heatMarkersDecorations")
                .and_then(Value::as_array)
                .and_then(|decorations| decorations.iter().find_map(overlay_label));

            return Some(RawHeatmap { markers, label });
        }
        None
    }
}

fn overlay_label(container: &Value) -> Option<(String, u64)> {
    let renderer = container.get("heatMarkerDecorationRenderer")?;
    let timed = renderer.get("timedMarkerDecorationRenderer");
    let text = timed
        .and_then(|t| t.pointer("/label/label/runs/0/text").or_else(|| t.pointer("/label/runs/0/text")))
        .and_then(Value::as_str)?;
    let time = renderer
        .pointer("/visibleOnLoadMarkerDecorationRenderer/markerTiming/startOffsetMillis")
        .and_then(as_millis)
        .or_else(|| timed.and_then(|t| t.get("decorationTimeMillis")).and_then(as_millis))?;
    Some((text.to_string(), time))
}

/// `frameworkUpdates → entityBatchUpdate → mutations[] → macroMarkersListEntity`
pub struct FrameworkUpdatesStrategy;

impl HeatmapStrategy for FrameworkUpdatesStrategy {
    fn name(&self) -> &'static str {
        "framework_updates"
    }

    fn extract(&self, initial_data: &Value) -> Option<RawHeatmap> {
        let mutations = initial_data
            .pointer("/frameworkUpdates/entityBatchUpdate/mutations")?
            .as_array()?;

        for (index, mutation) in mutations.iter().enumerate() {
            let Some(list) = mutation.pointer("/payload/macroMarkersListEntity/markersList") else {
                continue;
            };
            if list.get("markerType").and_then(Value::as_str) != Some("MARKER_TYPE_HEATMAP") {
                continue;
            }

            let markers = list
                .get("markers")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if markers.is_empty() {
                continue;
            }
            debug!("Found {} heatmap markers in mutation {}", markers.len(), index);

            let label = list
                .pointer("/markersDecoration/timedMarkerDecorations/0")
                .and_then(|decoration| {
                    let text = decoration.pointer("/label/runs/0/text").and_then(Value::as_str)?;
                    let time = decoration.get("decorationTimeMillis").and_then(as_millis)?;
                    Some((text.to_string(), time))
                });

            return Some(RawHeatmap { markers, label });
        }
        None
    }
}

/// Strategies in the order they are tried
pub fn default_strategies() -> Vec<Box<dyn HeatmapStrategy>> {
    vec![Box::new(PlayerOverlayStrategy), Box::new(FrameworkUpdatesStrategy)]
}

/// A marker with all three required fields
#[derive(Debug, Clone, Copy)]
struct ValidMarker {
    start: u64,
    duration: u64,
    intensity: f64,
}

fn parse_marker(marker: &Value) -> Option<ValidMarker> {
    // Older pages wrap each marker in a renderer with longer field names
    if let Some(inner) = marker.get("heatMarkerRenderer") {
        return Some(ValidMarker {
            start: inner.get("timeRangeStartMillis").and_then(as_millis)?,
            duration: inner.get("markerDurationMillis").and_then(as_millis)?,
            intensity: inner.get("heatMarkerIntensityScoreNormalized").and_then(as_float)?,
        });
    }

    Some(ValidMarker {
        start: marker.get("startMillis").and_then(as_millis)?,
        duration: marker.get("durationMillis").and_then(as_millis)?,
        intensity: marker.get("intensityScoreNormalized").and_then(as_float)?,
    })
}

fn as_millis(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Format milliseconds as zero-padded `MM:SS`
pub fn format_millis(ms: u64) -> String {
    let seconds_total = ms / 1000;
    format!("{:02}:{:02}", seconds_total / 60, seconds_total % 60)
}

/// Format a decimal millisecond string as `MM:SS`, or `N/A` when it is not one
pub fn format_ms_to_time_string(ms: &str) -> String {
    if ms.is_empty() || !ms.chars().all(|c| c.is_ascii_digit()) {
        return "N/A".to_string();
    }
    ms.parse().map(format_millis).unwrap_or_else(|_| "N/A".to_string())
}

/// Turn the raw strategy output into the public summary
fn summarize(video_id: &str, raw: RawHeatmap, strategy: &'static str) -> Result<HeatmapData, HeatmapError> {
    let valid: Vec<ValidMarker> = raw.markers.iter().filter_map(parse_marker).collect();
    debug!("Found {}/{} valid markers for {}", valid.len(), raw.markers.len(), video_id);

    if valid.is_empty() && raw.label.is_none() {
        return Err(HeatmapError::Incomplete);
    }

    let highest_intensity_marker_data = valid
        .iter()
        .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
        .map(|m| HeatMarker {
            start_millis: m.start.to_string(),
            duration_millis: m.duration.to_string(),
            intensity_score_normalized: m.intensity.to_string(),
            formatted_start_time: Some(format_millis(m.start)),
            formatted_duration: Some(format_millis(m.duration)),
        });

    let most_replayed_label_marker_data = raw.label.as_ref().map(|(_, time)| HeatMarker {
        start_millis: time.to_string(),
        duration_millis: LABEL_MARKER_DURATION_MS.to_string(),
        intensity_score_normalized: LABEL_MARKER_INTENSITY.to_string(),
        formatted_start_time: None,
        formatted_duration: None,
    });

    let most_replayed_label = raw.label.map(|(label_text, time)| MostReplayedLabel {
        label_text,
        decoration_time_millis: time.to_string(),
        formatted_time: format_millis(time),
    });

    Ok(HeatmapData {
        video_id: video_id.to_string(),
        most_replayed_label,
        most_replayed_label_marker_data,
        highest_intensity_marker_data,
        marker_count: valid.len(),
        strategy,
    })
}

fn initial_data_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"var\s+ytInitialData\s*=\s*(\{.*?\});\s*</script>",
            r#"window\["ytInitialData"\]\s*=\s*(\{.*?\});"#,
            r"var ytInitialData\s*=\s*(\{.*?\});",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Return the balanced `{...}` object starting at the first brace of `text`
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Candidate `ytInitialData` JSON texts, most reliable first
fn initial_data_candidates(html: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    let document = Html::parse_document(html);
    if let Ok(selector) = Selector::parse("script") {
        for script in document.select(&selector) {
            let text: String = script.text().collect();
            if let Some(pos) = text.find("ytInitialData") {
                if let Some(object) = balanced_object(&text[pos..]) {
                    candidates.push(object.to_string());
                }
            }
        }
    }

    for pattern in initial_data_patterns() {
        if let Some(m) = pattern.captures(html).and_then(|caps| caps.get(1)) {
            candidates.push(m.as_str().to_string());
        }
    }

    candidates
}

/// Locate and parse `ytInitialData` in a watch page
pub fn parse_initial_data(html: &str) -> Result<Value, HeatmapError> {
    let candidates = initial_data_candidates(html);
    if candidates.is_empty() {
        return Err(HeatmapError::MissingInitialData);
    }

    let mut last_error = None;
    for candidate in &candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => last_error = Some("ytInitialData is not an object".to_string()),
            Err(e) => last_error = Some(e.to_string()),
        }
    }
    Err(HeatmapError::InvalidJson(last_error.unwrap_or_default()))
}

/// Fetches watch pages and extracts heatmap data from them
pub struct HeatmapScraper {
    client: Client,
    accept_language: String,
    strategies: Vec<Box<dyn HeatmapStrategy>>,
}

impl HeatmapScraper {
    /// Create a new scraper instance
    pub fn new(config: &HeatmapConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            accept_language: config.accept_language.clone(),
            strategies: default_strategies(),
        }
    }

    /// Replace the extraction strategies
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn HeatmapStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Fetch the watch page of `video_id` and extract its heatmap
    pub async fn fetch(&self, video_id: &str) -> Result<HeatmapData, HeatmapError> {
        let url = format!("https://www.youtube.com/watch?v={}", urlencoding::encode(video_id));
        info!("🌐 Fetching Most Replayed data for {}", video_id);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT_LANGUAGE, &self.accept_language)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| request_error(&url, e))?;
        let html = response.text().await.map_err(|e| request_error(&url, e))?;

        let result = self.extract(video_id, &html);
        match &result {
            Ok(data) => info!("✅ Heatmap for {} extracted via {}", video_id, data.strategy),
            Err(e) => warn!("⚠️ Heatmap extraction failed for {}: {}", video_id, e),
        }
        result
    }

    /// Extract heatmap data from an already fetched watch page
    pub fn extract(&self, video_id: &str, html: &str) -> Result<HeatmapData, HeatmapError> {
        let initial_data = parse_initial_data(html)?;
        self.extract_from_initial_data(video_id, &initial_data)
    }

    /// Run the strategies over parsed `ytInitialData`
    pub fn extract_from_initial_data(&self, video_id: &str, initial_data: &Value) -> Result<HeatmapData, HeatmapError> {
        for strategy in &self.strategies {
            match strategy.extract(initial_data) {
                Some(raw) => return summarize(video_id, raw, strategy.name()),
                None => debug!("Strategy {} found no heatmap for {}", strategy.name(), video_id),
            }
        }
        Err(HeatmapError::NotFound)
    }
}

fn request_error(url: &str, e: reqwest::Error) -> HeatmapError {
    if e.is_timeout() {
        HeatmapError::Timeout(url.to_string())
    } else {
        HeatmapError::Request {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scraper() -> HeatmapScraper {
        HeatmapScraper::new(&HeatmapConfig::default())
    }

    fn overlay_data() -> Value {
        json!({
            "playerOverlays": {"playerOverlayRenderer": {"decoratedPlayerBarRenderer": {"decoratedPlayerBarRenderer": {
                "playerBar": {"multiMarkersPlayerBarRenderer": {"markersMap": [
                    {"key": "DESCRIPTION_CHAPTERS", "value": {}},
                    {"key": "HEATSEEKER", "value": {"heatmap": {"heatmapRenderer": {
                        "heatMarkers": [
                            {"heatMarkerRenderer": {"timeRangeStartMillis": 0, "markerDurationMillis": 2000, "heatMarkerIntensityScoreNormalized": 0.2}},
                            {"heatMarkerRenderer": {"timeRangeStartMillis": 2000, "markerDurationMillis": 2000, "heatMarkerIntensityScoreNormalized": 1.0}}
                        ],
                        "heatMarkersDecorations": [{"heatMarkerDecorationRenderer": {
                            "timedMarkerDecorationRenderer": {
                                "label": {"runs": [{"text": "Most replayed"}]},
                                "decorationTimeMillis": 125000
                            }
                        }}]
                    }}}}
                ]}}
            }}}}
        })
    }

    fn framework_data() -> Value {
        json!({
            "frameworkUpdates": {"entityBatchUpdate": {"mutations": [
                {"payload": {"someOtherEntity": {}}},
                {"payload": {"macroMarkersListEntity": {"markersList": {
                    "markerType": "MARKER_TYPE_HEATMAP",
                    "markers": [
                        {"startMillis": "0", "durationMillis": "3000", "intensityScoreNormalized": 0.5},
                        {"startMillis": "63000", "durationMillis": "3000", "intensityScoreNormalized": 1},
                        {"startMillis": "bad"}
                    ],
                    "markersDecoration": {"timedMarkerDecorations": [
                        {"label": {"runs": [{"text": "Most replayed"}]}, "decorationTimeMillis": 64000}
                    ]}
                }}}}
            ]}}
        })
    }

    #[test]
    fn test_format_ms_to_time_string() {
        assert_eq!(format_ms_to_time_string("125000"), "02:05");
        assert_eq!(format_ms_to_time_string("0"), "00:00");
        assert_eq!(format_ms_to_time_string("abc"), "N/A");
        assert_eq!(format_ms_to_time_string(""), "N/A");
        assert_eq!(format_millis(3_600_000), "60:00");
    }

    #[test]
    fn test_player_overlay_strategy() {
        let data = scraper().extract_from_initial_data("vid", &overlay_data()).unwrap();

        assert_eq!(data.strategy, "player_overlays");
        assert_eq!(data.marker_count, 2);
        let highest = data.highest_intensity_marker_data.unwrap();
        assert_eq!(highest.start_millis, "2000");
        assert_eq!(highest.formatted_start_time.as_deref(), Some("00:02"));

        let label = data.most_replayed_label.unwrap();
        assert_eq!(label.label_text, "Most replayed");
        assert_eq!(label.formatted_time, "02:05");

        let label_marker = data.most_replayed_label_marker_data.unwrap();
        assert_eq!(label_marker.start_millis, "125000");
        assert_eq!(label_marker.duration_millis, "5000");
        assert_eq!(label_marker.intensity_score_normalized, "0.9");
    }

    #[test]
    fn test_framework_updates_fallback() {
        let data = scraper().extract_from_initial_data("vid", &framework_data()).unwrap();

        assert_eq!(data.strategy, "framework_updates");
        assert_eq!(data.marker_count, 2);
        assert_eq!(data.highest_intensity_marker_data.unwrap().start_millis, "63000");
        assert_eq!(data.most_replayed_label.unwrap().decoration_time_millis, "64000");
    }

    #[test]
    fn test_not_found_and_incomplete() {
        let err = scraper().extract_from_initial_data("vid", &json!({"contents": {}})).unwrap_err();
        assert!(matches!(err, HeatmapError::NotFound));

        let invalid_only = json!({"frameworkUpdates": {"entityBatchUpdate": {"mutations": [
            {"payload": {"macroMarkersListEntity": {"markersList": {
                "markerType": "MARKER_TYPE_HEATMAP",
                "markers": [{"startMillis": "0"}]
            }}}}
        ]}}});
        let err = scraper().extract_from_initial_data("vid", &invalid_only).unwrap_err();
        assert!(matches!(err, HeatmapError::Incomplete));
    }

    #[test]
    fn test_initial_data_from_html() {
        let payload = framework_data().to_string();
        let html = format!(
            "<html><head><script>var ytInitialData = {};</script></head><body></body></html>",
            payload
        );

        let data = scraper().extract("vid", &html).unwrap();
        assert_eq!(data.marker_count, 2);
    }

    #[test]
    fn test_initial_data_with_braces_in_strings() {
        let html = r#"<script>window["ytInitialData"] = {"title": "a } b {", "n": {"x": 1}};</script>"#;
        let value = parse_initial_data(html).unwrap();
        assert_eq!(value["title"], "a } b {");
        assert_eq!(value["n"]["x"], 1);
    }

    #[test]
    fn test_missing_initial_data() {
        let err = parse_initial_data("<html><script>var other = {};</script></html>").unwrap_err();
        assert!(matches!(err, HeatmapError::MissingInitialData));

        let err = parse_initial_data("<script>var ytInitialData = {broken;</script>").unwrap_err();
        assert!(matches!(err, HeatmapError::InvalidJson(_) | HeatmapError::MissingInitialData));
    }
}
