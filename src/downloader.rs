//! Audio acquisition through yt-dlp

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;

/// A real Netscape cookies file is at least this many bytes
const MIN_COOKIES_FILE_SIZE: u64 = 50;

/// Progress notifications emitted while a download runs
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadProgress {
    Downloading { percent: f64, message: String },
    Finished,
}

/// Fetches the audio track of a video into a local file
#[async_trait]
pub trait AudioDownloader: Send + Sync {
    /// Download the audio of `url` to exactly `destination`
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf, DownloadError>;
}

/// Downloader that runs the yt-dlp CLI with ffmpeg post-processing
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    config: DownloadConfig,
}

impl YtDlpDownloader {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, output_template: &str, cookie_file: Option<&Path>, url: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "--newline",
            "--no-playlist",
            "--no-warnings",
            "--no-check-certificates",
            "--sleep-requests", "2",
            "--max-sleep-interval", "5",
            "--throttled-rate", "1M",
            "-f", &self.config.format,
            "-x",
            "--audio-format", &self.config.audio_format,
            "--audio-quality", &self.config.audio_quality,
            "--user-agent", &self.config.user_agent,
            "-o", output_template,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.config.ffmpeg_binary != "ffmpeg" {
            args.push("--ffmpeg-location".to_string());
            args.push(self.config.ffmpeg_binary.clone());
        }

        if let Some(cookies) = cookie_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }

        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    async fn run(
        &self,
        args: &[String],
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<(), DownloadError> {
        let mut child = Command::new(&self.config.ytdlp_binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DownloadError::ToolMissing(self.config.ytdlp_binary.clone())
                } else {
                    DownloadError::Failed(format!("failed to start {}: {}", self.config.ytdlp_binary, e))
                }
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buffer).await;
            }
            buffer
        });

        // stdout carries one progress line per update thanks to --newline
        let mut output_tail = Vec::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(update) = parse_progress_line(&line) {
                    progress(update);
                } else {
                    debug!("yt-dlp: {}", line);
                    output_tail.push(line);
                    if output_tail.len() > 20 {
                        output_tail.remove(0);
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DownloadError::Failed(format!("yt-dlp did not exit cleanly: {}", e)))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }

        debug!("yt-dlp stderr: {}", stderr_text);
        let diagnostics = if stderr_text.trim().is_empty() {
            output_tail.join("\n")
        } else {
            stderr_text
        };
        Err(DownloadError::classify(&diagnostics))
    }
}

#[async_trait]
impl AudioDownloader for YtDlpDownloader {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf, DownloadError> {
        let parent = destination
            .parent()
            .ok_or_else(|| DownloadError::Failed(format!("invalid destination {}", destination.display())))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::Failed(format!("cannot create {}: {}", parent.display(), e)))?;

        // Each download works in its own scratch directory next to the destination
        let scratch = tempfile::TempDir::new_in(parent)
            .map_err(|e| DownloadError::Failed(format!("cannot create scratch directory: {}", e)))?;
        let output_template = scratch.path().join("%(id)s.%(ext)s");

        let cookie_file = match self.config.cookie_file.as_deref() {
            Some(path) => usable_cookie_file(path).await,
            None => None,
        };
        if cookie_file.is_none() {
            debug!("No usable cookie file, downloading without cookies");
        }

        let args = self.build_args(&output_template.to_string_lossy(), cookie_file.as_deref(), url);
        info!("📥 Downloading audio for {}", url);

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        match tokio::time::timeout(timeout, self.run(&args, progress)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("⏰ Download timed out after {}s: {}", self.config.timeout_seconds, url);
                return Err(DownloadError::TimedOut(self.config.timeout_seconds));
            }
        }

        let produced = find_audio_file(scratch.path(), &self.config.audio_format)
            .await
            .ok_or_else(|| {
                DownloadError::MissingOutput(format!("no .{} file in {}", self.config.audio_format, scratch.path().display()))
            })?;

        move_file(&produced, destination)
            .await
            .map_err(|e| DownloadError::Failed(format!("cannot move audio into place: {}", e)))?;

        progress(DownloadProgress::Finished);
        info!("✅ Audio downloaded: {}", destination.display());
        Ok(destination.to_path_buf())
    }
}

fn progress_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%(?:\s+of\s+~?\s*(\S+))?(?:\s+at\s+(\S+))?").ok()
        })
        .as_ref()
}

/// Parse one line of yt-dlp output into a progress update
pub fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    let line = line.trim();

    if line.starts_with("[ExtractAudio]") {
        return Some(DownloadProgress::Finished);
    }

    let caps = progress_pattern()?.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2).map_or("N/A", |m| m.as_str());
    let speed = caps.get(3).map_or("N/A", |m| m.as_str());

    Some(DownloadProgress::Downloading {
        percent,
        message: format!("Downloading: {:.1}% of {} at {}", percent, total, speed),
    })
}

async fn find_audio_file(dir: &Path, extension: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == extension) {
            return Some(path);
        }
    }
    None
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Check that a cookies file looks like Netscape format.
///
/// Netscape cookies files either start with the standard header or contain
/// tab-separated lines with at least six fields.
pub fn is_valid_netscape_cookies(content: &str) -> bool {
    if content.starts_with("# Netscape HTTP Cookie File") || content.starts_with("# HTTP Cookie File") {
        return true;
    }

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .any(|line| line.split('\t').count() >= 6)
}

/// Return `path` if it exists, is big enough and is in Netscape format
pub async fn usable_cookie_file(path: &Path) -> Option<PathBuf> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.len() >= MIN_COOKIES_FILE_SIZE => {}
        Ok(metadata) => {
            debug!("Cookies file {} is too small ({} bytes), skipping", path.display(), metadata.len());
            return None;
        }
        Err(_) => {
            debug!("Cookies file not found at {}, skipping", path.display());
            return None;
        }
    }

    match tokio::fs::read_to_string(path).await {
        Ok(content) if is_valid_netscape_cookies(&content) => Some(path.to_path_buf()),
        Ok(_) => {
            warn!("Cookies file {} is not in Netscape format, skipping", path.display());
            None
        }
        Err(e) => {
            warn!("Failed to read cookies file: {}", e);
            None
        }
    }
}

/// Write a cookie blob (e.g. from `YOUTUBE_COOKIES`) to `path`.
///
/// Returns `Ok(false)` when the blob is not a usable cookies file.
pub async fn install_cookies(content: &str, path: &Path) -> std::io::Result<bool> {
    if !is_valid_netscape_cookies(content) {
        warn!("🍪 Cookie blob is not in Netscape format, ignoring it");
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    info!("🍪 Installed YouTube cookies at {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const COOKIES: &str = "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t0\tPREF\tf6=40000000\n";

    #[test]
    fn test_parse_progress_line() {
        let update = parse_progress_line("[download]  42.3% of  3.45MiB at  1.23MiB/s ETA 00:02").unwrap();
        assert_eq!(
            update,
            DownloadProgress::Downloading {
                percent: 42.3,
                message: "Downloading: 42.3% of 3.45MiB at 1.23MiB/s".to_string(),
            }
        );

        assert_eq!(
            parse_progress_line("[ExtractAudio] Destination: /tmp/x/abc.mp3"),
            Some(DownloadProgress::Finished)
        );
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn test_parse_progress_without_size() {
        match parse_progress_line("[download] 100%") {
            Some(DownloadProgress::Downloading { percent, message }) => {
                assert_eq!(percent, 100.0);
                assert!(message.contains("N/A"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_netscape_cookie_validation() {
        assert!(is_valid_netscape_cookies(COOKIES));
        assert!(is_valid_netscape_cookies(".youtube.com\tTRUE\t/\tTRUE\t0\tSID\tvalue"));
        assert!(!is_valid_netscape_cookies("SID=value; HSID=other"));
        assert!(!is_valid_netscape_cookies(""));
    }

    #[tokio::test]
    async fn test_install_and_use_cookies() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("cookies.txt");

        assert!(!install_cookies("not cookies", &path).await.unwrap());
        assert!(usable_cookie_file(&path).await.is_none());

        assert!(install_cookies(COOKIES, &path).await.unwrap());
        assert_eq!(usable_cookie_file(&path).await, Some(path.clone()));
    }

    #[test]
    fn test_build_args_with_cookies() {
        let downloader = YtDlpDownloader::new(DownloadConfig::default());
        let args = downloader.build_args("/tmp/out/%(id)s.%(ext)s", Some(Path::new("/tmp/c.txt")), "https://youtu.be/abc");

        assert!(args.windows(2).any(|w| w[0] == "--cookies" && w[1] == "/tmp/c.txt"));
        assert!(args.windows(2).any(|w| w[0] == "--audio-format" && w[1] == "mp3"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_retryable() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = DownloadConfig {
            ytdlp_binary: "definitely-not-a-real-yt-dlp-binary".to_string(),
            ..DownloadConfig::default()
        };
        let downloader = YtDlpDownloader::new(config);
        let seen = Mutex::new(Vec::new());
        let sink = |p: DownloadProgress| seen.lock().unwrap().push(p);

        let err = downloader
            .download("https://youtu.be/abc", &temp_dir.path().join("abc.mp3"), &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::ToolMissing(_)));
        assert!(!err.is_retryable());
        assert!(seen.lock().unwrap().is_empty());
    }
}
