use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the highlight analyzer service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Cache and download directories
    pub storage: StorageConfig,

    /// Highlight detection tuning
    pub detection: DetectionConfig,

    /// External download tool settings
    pub download: DownloadConfig,

    /// Most Replayed scraper settings
    pub heatmap: HeatmapConfig,

    /// Worker pool settings
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Directory holding the bundled frontend
    pub static_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// One JSON file per analysed video
    pub cache_dir: PathBuf,

    /// Downloaded/transcoded audio files
    pub download_dir: PathBuf,

    /// Keep audio after analysis (served under /download) instead of deleting it
    pub retain_downloads: bool,

    /// Run the cache/download reconciliation pass at startup
    pub reconcile_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Decode sample rate; only the gross energy envelope matters
    pub target_sample_rate: u32,

    /// Analysis frame length in milliseconds
    pub frame_ms: u32,

    /// Hop between frames in milliseconds
    pub hop_ms: u32,

    /// Clips shorter than this are not analysed
    pub min_duration_seconds: f64,

    /// Minimum number of energy frames required
    pub min_frames: usize,

    /// Candidate percentiles, strictest first
    pub percentiles: Vec<f64>,

    /// Fraction of frames above which a threshold is considered degenerate
    pub max_selected_fraction: f64,

    /// Retained points needed to accept a percentile
    pub min_retained_points: usize,

    /// Minimum distance between two reported highlights (seconds)
    pub min_spacing_seconds: f64,

    /// Minimum distance between peaks for the local-maxima fallback (seconds)
    pub peak_distance_seconds: f64,

    /// Upper bound on reported highlights
    pub max_highlights: usize,

    /// Synthesize evenly spaced placeholders when nothing is detected
    pub synthesize_fallback: bool,

    /// Number of placeholder highlights
    pub fallback_count: usize,

    /// Placeholders are only synthesized for clips longer than this
    pub fallback_min_duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// yt-dlp executable
    pub ytdlp_binary: String,

    /// ffmpeg executable used for decoding
    pub ffmpeg_binary: String,

    /// ffprobe executable used for duration probing
    pub ffprobe_binary: String,

    /// yt-dlp format selector; smallest audio is enough for energy analysis
    pub format: String,

    /// Target audio codec after extraction
    pub audio_format: String,

    /// yt-dlp audio quality (0 best .. 10 worst, or bitrate like "48K")
    pub audio_quality: String,

    /// Download timeout in seconds
    pub timeout_seconds: u64,

    /// Netscape cookie file handed to yt-dlp when present
    pub cookie_file: Option<PathBuf>,

    /// Browser user agent for the download tool
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// HTTP request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Accept-Language header sent with page requests
    pub accept_language: String,

    /// User agent for page requests
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Maximum number of concurrently running analysis jobs
    pub max_workers: usize,
}

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            static_dir: PathBuf::from("frontend/dist"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("yt-hl");
        Self {
            cache_dir: base.join("cache"),
            download_dir: base.join("downloads"),
            retain_downloads: false,
            reconcile_on_startup: true,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000,
            frame_ms: 100,
            hop_ms: 50,
            min_duration_seconds: 5.0,
            min_frames: 10,
            percentiles: vec![98.0, 95.0, 90.0, 85.0, 80.0],
            max_selected_fraction: 0.5,
            min_retained_points: 3,
            min_spacing_seconds: 5.0,
            peak_distance_seconds: 2.0,
            max_highlights: 15,
            synthesize_fallback: true,
            fallback_count: 5,
            fallback_min_duration_seconds: 30.0,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            ytdlp_binary: "yt-dlp".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
            format: "worstaudio/worst".to_string(),
            audio_format: "mp3".to_string(),
            audio_quality: "5".to_string(),
            timeout_seconds: 600,
            cookie_file: None,
            user_agent: BROWSER_USER_AGENT.to_string(),
        }
    }
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 20,
            accept_language: "en-US,en;q=0.9".to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            // Each job is a download plus a full decode; keep the pool small
            max_workers: num_cpus::get().clamp(1, 2),
        }
    }
}

impl DetectionConfig {
    /// Frame length in samples at the target rate
    pub fn frame_length(&self) -> usize {
        (self.target_sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }

    /// Hop length in samples at the target rate
    pub fn hop_length(&self) -> usize {
        (self.target_sample_rate as u64 * self.hop_ms as u64 / 1000) as usize
    }
}

impl Config {
    /// Load configuration from the first readable config file, then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let config_paths = [
            "yt-highlights.toml",
            "config/yt-highlights.toml",
            "/etc/yt-highlights/config.toml",
        ];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&config_str) {
                    Ok(config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config.with_env_overrides());
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Ok(Self::from_env())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&config_str)?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        Ok(config.with_env_overrides())
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("YTHL_CACHE_DIR") {
            self.storage.cache_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("YTHL_DOWNLOAD_DIR") {
            self.storage.download_dir = PathBuf::from(dir);
        }

        if let Ok(workers) = std::env::var("YTHL_WORKERS") {
            match workers.parse() {
                Ok(n) => self.performance.max_workers = n,
                Err(_) => tracing::warn!("Ignoring invalid YTHL_WORKERS value: {}", workers),
            }
        }

        if let Ok(port) = std::env::var("YTHL_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!("Ignoring invalid YTHL_PORT value: {}", port),
            }
        }

        if let Ok(retain) = std::env::var("YTHL_RETAIN_DOWNLOADS") {
            self.storage.retain_downloads = matches!(retain.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(dir) = std::env::var("YTHL_STATIC_DIR") {
            self.server.static_dir = PathBuf::from(dir);
        }

        if let Ok(path) = std::env::var("YTHL_COOKIE_FILE") {
            self.download.cookie_file = Some(PathBuf::from(path));
        }

        self
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.performance.max_workers == 0 {
            return Err(anyhow!("max_workers must be greater than 0"));
        }

        let detection = &self.detection;
        if detection.target_sample_rate == 0 {
            return Err(anyhow!("target_sample_rate must be greater than 0"));
        }

        if detection.frame_length() == 0 || detection.hop_length() == 0 {
            return Err(anyhow!("frame_ms and hop_ms must be at least one sample long"));
        }

        if detection.hop_ms > detection.frame_ms {
            return Err(anyhow!("hop_ms ({}) must not exceed frame_ms ({})", detection.hop_ms, detection.frame_ms));
        }

        if detection.percentiles.is_empty() {
            return Err(anyhow!("at least one detection percentile is required"));
        }

        if detection.percentiles.iter().any(|p| !(0.0..=100.0).contains(p)) {
            return Err(anyhow!("percentiles must lie within 0..=100"));
        }

        if !(detection.min_spacing_seconds > 0.0 && detection.min_spacing_seconds <= 60.0) {
            return Err(anyhow!("min_spacing_seconds must be within (0, 60]"));
        }

        if detection.max_highlights == 0 {
            return Err(anyhow!("max_highlights must be greater than 0"));
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Highlight Analyzer Configuration:\n\
            - Bind: {}:{}\n\
            - Workers: {}\n\
            - Cache Directory: {}\n\
            - Download Directory: {}\n\
            - Retain Downloads: {}\n\
            - Sample Rate: {}Hz\n\
            - Max Highlights: {}",
            self.server.host,
            self.server.port,
            self.performance.max_workers,
            self.storage.cache_dir.display(),
            self.storage.download_dir.display(),
            self.storage.retain_downloads,
            self.detection.target_sample_rate,
            self.detection.max_highlights,
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.performance.max_workers = workers;
        self
    }

    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.cache_dir = dir;
        self
    }

    pub fn with_download_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.download_dir = dir;
        self
    }

    pub fn retain_downloads(mut self, retain: bool) -> Self {
        self.config.storage.retain_downloads = retain;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_min_spacing(mut self, seconds: f64) -> Self {
        self.config.detection.min_spacing_seconds = seconds;
        self
    }

    pub fn with_max_highlights(mut self, max: usize) -> Self {
        self.config.detection.max_highlights = max;
        self
    }

    pub fn synthesize_fallback(mut self, enable: bool) -> Self {
        self.config.detection.synthesize_fallback = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
