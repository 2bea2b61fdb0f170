use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AnalyzerError, Result};

/// Mono waveform decoded at a known sample rate
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Audio file information reported by ffprobe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioInfo {
    pub path: PathBuf,
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: u32,
    pub format: String,
    pub file_size: u64,
}

/// Turns an audio file into a mono waveform
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    /// Decode `path` to mono at `sample_rate`
    async fn decode(&self, path: &Path, sample_rate: u32) -> Result<DecodedAudio>;

    /// Duration of `path` in seconds without a full decode
    async fn probe_duration(&self, path: &Path) -> Result<f64>;
}

/// Decoder that shells out to ffmpeg/ffprobe
#[derive(Clone)]
pub struct FfmpegDecoder {
    ffmpeg_binary: String,
    ffprobe_binary: String,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_binary: impl Into<String>, ffprobe_binary: impl Into<String>) -> Self {
        Self {
            ffmpeg_binary: ffmpeg_binary.into(),
            ffprobe_binary: ffprobe_binary.into(),
        }
    }

    /// Get detailed audio information
    pub async fn get_audio_info(&self, audio_path: &Path) -> Result<AudioInfo> {
        let output = tokio::process::Command::new(&self.ffprobe_binary)
            .args([
                "-v", "quiet",
                "-print_format", "json",
                "-show_format",
                "-show_streams",
                "-select_streams", "a:0", // First audio stream
            ])
            .arg(audio_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AnalyzerError::Decode(format!("failed to run {}: {}", self.ffprobe_binary, e)))?;

        if !output.status.success() {
            return Err(AnalyzerError::Decode(format!("ffprobe failed for {}", audio_path.display())));
        }

        let probe: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let format = &probe["format"];
        let audio_stream = probe["streams"]
            .as_array()
            .and_then(|streams| streams.first())
            .ok_or_else(|| AnalyzerError::Decode("No audio stream found".to_string()))?;

        let duration_seconds = parse_duration(format["duration"].as_str());

        let file_size = tokio::fs::metadata(audio_path).await?.len();

        Ok(AudioInfo {
            path: audio_path.to_path_buf(),
            duration: Duration::from_secs_f64(duration_seconds),
            sample_rate: audio_stream["sample_rate"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            channels: audio_stream["channels"].as_u64().unwrap_or(1) as u32,
            format: audio_stream["codec_name"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            file_size,
        })
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

#[async_trait]
impl AudioDecoder for FfmpegDecoder {
    async fn decode(&self, path: &Path, sample_rate: u32) -> Result<DecodedAudio> {
        debug!("🎵 Decoding {} to mono {}Hz", path.display(), sample_rate);

        // Raw little-endian f32 on stdout avoids a temporary WAV file
        let output = tokio::process::Command::new(&self.ffmpeg_binary)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args([
                "-vn", // No video stream
                "-ac", "1", // Mono channel
                "-ar", &sample_rate.to_string(),
                "-f", "f32le",
                "-acodec", "pcm_f32le",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AnalyzerError::Decode(format!("failed to run {}: {}", self.ffmpeg_binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AnalyzerError::Decode(format!(
                "ffmpeg could not decode {}: {}",
                path.display(),
                stderr.lines().last().unwrap_or("unknown error")
            )));
        }

        let samples = samples_from_f32le(&output.stdout);
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(AnalyzerError::Decode(format!("non-finite samples in {}", path.display())));
        }

        let decoded = DecodedAudio::new(samples, sample_rate);
        info!("✅ Decoded {} ({:.1}s, {}Hz)", path.display(), decoded.duration_seconds(), sample_rate);
        Ok(decoded)
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        Ok(self.get_audio_info(path).await?.duration.as_secs_f64())
    }
}

/// ffprobe duration field in seconds, zero unless it is a finite positive number
fn parse_duration(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0)
}

/// Reinterpret raw little-endian f32 PCM; a trailing partial sample is ignored
pub fn samples_from_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_from_f32le() {
        let mut bytes = Vec::new();
        for v in [0.0f32, 0.5, -1.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.push(0xAB); // partial sample

        assert_eq!(samples_from_f32le(&bytes), vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_parse_duration_rejects_unusable_values() {
        assert_eq!(parse_duration(Some("212.480000")), 212.48);
        assert_eq!(parse_duration(Some("N/A")), 0.0);
        assert_eq!(parse_duration(Some("nan")), 0.0);
        assert_eq!(parse_duration(Some("inf")), 0.0);
        assert_eq!(parse_duration(Some("-1.5")), 0.0);
        assert_eq!(parse_duration(None), 0.0);

        // Whatever ffprobe reports must be a valid Duration
        for raw in ["NaN", "infinity", "1e400", "-0.0"] {
            let _ = Duration::from_secs_f64(parse_duration(Some(raw)));
        }
    }

    #[test]
    fn test_decoded_duration() {
        let audio = DecodedAudio::new(vec![0.0; 32000], 16000);
        assert!((audio.duration_seconds() - 2.0).abs() < 1e-12);
        assert_eq!(DecodedAudio::new(vec![0.0; 10], 0).duration_seconds(), 0.0);
    }

    #[tokio::test]
    async fn test_decode_garbage_file_is_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("garbage.mp3");
        tokio::fs::write(&path, b"definitely not audio").await.unwrap();

        // Fails whether or not ffmpeg is installed
        let decoder = FfmpegDecoder::default();
        assert!(decoder.decode(&path, 16000).await.is_err());
    }

    #[test]
    fn test_missing_binaries_report_decode_errors() {
        tokio_test::block_on(async {
            let decoder = FfmpegDecoder::new("no-such-ffmpeg-binary", "no-such-ffprobe-binary");
            let path = Path::new("clip.mp3");

            assert!(matches!(decoder.decode(path, 16000).await, Err(AnalyzerError::Decode(_))));
            assert!(decoder.probe_duration(path).await.is_err());
        });
    }
}
