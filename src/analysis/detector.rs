//! Energy-based highlight detection

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::energy::{frame_energies, frame_time, mean_and_std, percentile_of_sorted};
use crate::audio::AudioDecoder;
use crate::config::DetectionConfig;
use crate::models::DetectionMethod;

/// What the detector concluded about one audio file
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// At least one highlight was found
    Detected {
        highlights: Vec<f64>,
        method: DetectionMethod,
        duration: f64,
    },
    /// The audio was analysed but nothing stood out (or it was too short)
    NoHighlights { duration: f64 },
    /// The file could not be read or decoded
    Undecodable(String),
}

impl DetectionOutcome {
    pub fn highlights(&self) -> &[f64] {
        match self {
            DetectionOutcome::Detected { highlights, .. } => highlights,
            _ => &[],
        }
    }

    pub fn into_highlights(self) -> Vec<f64> {
        match self {
            DetectionOutcome::Detected { highlights, .. } => highlights,
            _ => Vec::new(),
        }
    }

    pub fn duration(&self) -> Option<f64> {
        match self {
            DetectionOutcome::Detected { duration, .. } | DetectionOutcome::NoHighlights { duration } => {
                Some(*duration)
            }
            DetectionOutcome::Undecodable(_) => None,
        }
    }
}

/// Result of running detection over an in-memory waveform
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDetection {
    pub highlights: Vec<f64>,
    pub method: Option<DetectionMethod>,
    pub duration: f64,
}

impl From<SampleDetection> for DetectionOutcome {
    fn from(detection: SampleDetection) -> Self {
        match detection.method {
            Some(method) if !detection.highlights.is_empty() => DetectionOutcome::Detected {
                highlights: detection.highlights,
                method,
                duration: detection.duration,
            },
            _ => DetectionOutcome::NoHighlights {
                duration: detection.duration,
            },
        }
    }
}

/// A candidate highlight before final selection
#[derive(Debug, Clone, Copy)]
struct Candidate {
    time: f64,
    strength: f64,
}

/// Finds highlight timestamps in audio files
pub struct HighlightDetector {
    config: DetectionConfig,
    decoder: Arc<dyn AudioDecoder>,
}

impl HighlightDetector {
    pub fn new(config: DetectionConfig, decoder: Arc<dyn AudioDecoder>) -> Self {
        Self { config, decoder }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Analyse an audio file. Never fails: unreadable input is reported as
    /// [`DetectionOutcome::Undecodable`].
    pub async fn analyze(&self, audio_path: &Path) -> DetectionOutcome {
        match tokio::fs::metadata(audio_path).await {
            Ok(meta) if meta.len() == 0 => {
                warn!("⚠️ Audio file is empty: {}", audio_path.display());
                return DetectionOutcome::Undecodable("audio file is empty".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("⚠️ Audio file not readable {}: {}", audio_path.display(), e);
                return DetectionOutcome::Undecodable(format!("audio file not readable: {}", e));
            }
        }

        let decoded = match self
            .decoder
            .decode(audio_path, self.config.target_sample_rate)
            .await
        {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("⚠️ Could not decode {}: {}", audio_path.display(), e);
                return DetectionOutcome::Undecodable(e.to_string());
            }
        };

        let config = self.config.clone();
        let joined = tokio::task::spawn_blocking(move || {
            detect_samples(&decoded.samples, decoded.sample_rate, &config)
        })
        .await;

        match joined {
            Ok(detection) => {
                info!(
                    "🎯 Found {} highlights in {} ({:.1}s of audio)",
                    detection.highlights.len(),
                    audio_path.display(),
                    detection.duration
                );
                detection.into()
            }
            Err(e) => {
                warn!("⚠️ Detection task failed for {}: {}", audio_path.display(), e);
                DetectionOutcome::Undecodable(format!("detection task failed: {}", e))
            }
        }
    }

    /// Container duration of an audio file the decoder could not analyse,
    /// if it can still be read
    pub async fn probe_duration(&self, audio_path: &Path) -> Option<f64> {
        match tokio::fs::metadata(audio_path).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => return None,
        }

        match self.decoder.probe_duration(audio_path).await {
            Ok(duration) if duration.is_finite() && duration > 0.0 => Some(duration),
            Ok(_) => None,
            Err(e) => {
                debug!("No duration for {}: {}", audio_path.display(), e);
                None
            }
        }
    }

    /// Analyse an audio file and return just the (possibly empty) highlight list
    pub async fn detect(&self, audio_path: &Path) -> Vec<f64> {
        self.analyze(audio_path).await.into_highlights()
    }
}

/// Run detection over a mono waveform.
///
/// Output is strictly ascending, rounded to two decimals, at most
/// `max_highlights` long, and consecutive values are at least
/// `min_spacing_seconds` apart.
pub fn detect_samples(samples: &[f32], sample_rate: u32, config: &DetectionConfig) -> SampleDetection {
    let duration = if sample_rate == 0 {
        0.0
    } else {
        samples.len() as f64 / sample_rate as f64
    };
    let empty = SampleDetection {
        highlights: Vec::new(),
        method: None,
        duration,
    };

    if duration < config.min_duration_seconds {
        debug!("Audio too short for detection: {:.2}s", duration);
        return empty;
    }

    let frame_length = (sample_rate as u64 * config.frame_ms as u64 / 1000) as usize;
    let hop_length = (sample_rate as u64 * config.hop_ms as u64 / 1000) as usize;
    let energies = frame_energies(samples, frame_length, hop_length);

    if energies.len() < config.min_frames.max(1) {
        debug!("Too few energy frames: {}", energies.len());
        return empty;
    }

    let to_time = |index: usize| frame_time(index, hop_length, sample_rate);

    let (candidates, method) = match percentile_candidates(&energies, &to_time, config) {
        Some(found) => (found, DetectionMethod::Percentile),
        None => {
            let hop_seconds = hop_length as f64 / sample_rate as f64;
            let distance = ((config.peak_distance_seconds / hop_seconds).round() as usize).max(1);
            let peaks = peak_candidates(&energies, &to_time, distance);
            if peaks.is_empty() {
                return empty;
            }
            debug!("Percentile thresholding found nothing, using {} energy peaks", peaks.len());
            (peaks, DetectionMethod::PeakSearch)
        }
    };

    let highlights = finalize(candidates, config.max_highlights, config.min_spacing_seconds);
    if highlights.is_empty() {
        return empty;
    }

    SampleDetection {
        highlights,
        method: Some(method),
        duration,
    }
}

/// Try each percentile cut, strictest first, and return the clustered
/// candidates of the first acceptable one (or of the loosest cut).
fn percentile_candidates(
    energies: &[f64],
    to_time: &dyn Fn(usize) -> f64,
    config: &DetectionConfig,
) -> Option<Vec<Candidate>> {
    let mut sorted = energies.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut percentiles = config.percentiles.clone();
    percentiles.sort_by(|a, b| b.total_cmp(a));

    let frame_limit = config.max_selected_fraction * energies.len() as f64;
    let mut loosest = Vec::new();

    for p in percentiles {
        let cut = percentile_of_sorted(&sorted, p);
        let selected: Vec<usize> = energies
            .iter()
            .enumerate()
            .filter(|&(_, &e)| e > cut)
            .map(|(i, _)| i)
            .collect();

        let clusters = cluster(&selected, energies, to_time, config.min_spacing_seconds);
        debug!(
            "p{}: cut {:.4}, {} frames, {} clusters",
            p,
            cut,
            selected.len(),
            clusters.len()
        );

        if !selected.is_empty()
            && (selected.len() as f64) < frame_limit
            && clusters.len() >= config.min_retained_points
        {
            return Some(clusters);
        }
        loosest = clusters;
    }

    if loosest.is_empty() {
        None
    } else {
        Some(loosest)
    }
}

/// Group time-ordered frames into clusters no wider than `min_spacing`,
/// each reported at its energy-weighted centre.
fn cluster(
    indices: &[usize],
    energies: &[f64],
    to_time: &dyn Fn(usize) -> f64,
    min_spacing: f64,
) -> Vec<Candidate> {
    struct Open {
        anchor: f64,
        weighted_time: f64,
        total: f64,
        peak: f64,
    }

    fn close(open: &Open) -> Option<Candidate> {
        (open.total > 0.0).then(|| Candidate {
            time: open.weighted_time / open.total,
            strength: open.peak,
        })
    }

    let mut clusters = Vec::new();
    let mut current: Option<Open> = None;

    for &index in indices {
        let time = to_time(index);
        let energy = energies[index];

        match current.as_mut() {
            Some(open) if time - open.anchor < min_spacing => {
                open.weighted_time += energy * time;
                open.total += energy;
                open.peak = open.peak.max(energy);
            }
            _ => {
                if let Some(done) = current.as_ref().and_then(close) {
                    clusters.push(done);
                }
                current = Some(Open {
                    anchor: time,
                    weighted_time: energy * time,
                    total: energy,
                    peak: energy,
                });
            }
        }
    }

    if let Some(done) = current.as_ref().and_then(close) {
        clusters.push(done);
    }
    clusters
}

/// Local maxima at least one standard deviation above the mean, with higher
/// peaks suppressing lower ones closer than `distance` frames.
fn peak_candidates(energies: &[f64], to_time: &dyn Fn(usize) -> f64, distance: usize) -> Vec<Candidate> {
    if energies.len() <= distance * 2 {
        return Vec::new();
    }

    let (mean, std) = mean_and_std(energies);
    let height = mean + std;

    let mut peaks: Vec<usize> = (1..energies.len() - 1)
        .filter(|&i| energies[i] > energies[i - 1] && energies[i] >= energies[i + 1] && energies[i] >= height)
        .collect();

    // Strongest first; earlier index breaks ties
    peaks.sort_by(|&a, &b| energies[b].total_cmp(&energies[a]).then(a.cmp(&b)));

    let mut kept: Vec<usize> = Vec::new();
    for index in peaks {
        if kept.iter().all(|&k| k.abs_diff(index) >= distance) {
            kept.push(index);
        }
    }
    kept.sort_unstable();

    kept.into_iter()
        .map(|i| Candidate {
            time: to_time(i),
            strength: energies[i],
        })
        .collect()
}

/// Keep the strongest candidates, then order, round and space them
fn finalize(mut candidates: Vec<Candidate>, max_highlights: usize, min_spacing: f64) -> Vec<f64> {
    candidates.sort_by(|a, b| b.strength.total_cmp(&a.strength).then(a.time.total_cmp(&b.time)));
    candidates.truncate(max_highlights);

    for candidate in candidates.iter_mut() {
        candidate.time = round2(candidate.time.max(0.0));
    }
    candidates.sort_by(|a, b| a.time.total_cmp(&b.time));

    enforce_spacing(candidates, min_spacing)
        .into_iter()
        .map(|c| c.time)
        .collect()
}

/// Drop the weaker of any consecutive pair closer than `min_spacing`
fn enforce_spacing(sorted: Vec<Candidate>, min_spacing: f64) -> Vec<Candidate> {
    const EPSILON: f64 = 1e-9;
    let mut kept: Vec<Candidate> = Vec::with_capacity(sorted.len());

    for candidate in sorted {
        match kept.last_mut() {
            Some(last) if candidate.time - last.time < min_spacing - EPSILON => {
                if candidate.strength > last.strength {
                    *last = candidate;
                }
            }
            _ => kept.push(candidate),
        }
    }
    kept
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Evenly spaced placeholder highlights between 10% and 90% of `duration`
pub fn synthesize_fallback(duration: f64, count: usize, min_spacing: f64) -> Vec<f64> {
    if count == 0 || !duration.is_finite() || duration <= 0.0 {
        return Vec::new();
    }

    let start = duration * 0.1;
    let span = duration * 0.8;
    let candidates: Vec<Candidate> = if count == 1 {
        vec![Candidate {
            time: round2(duration * 0.5),
            strength: 1.0,
        }]
    } else {
        (0..count)
            .map(|i| Candidate {
                time: round2(start + span * i as f64 / (count - 1) as f64),
                strength: 1.0,
            })
            .collect()
    };

    enforce_spacing(candidates, min_spacing)
        .into_iter()
        .map(|c| c.time)
        .collect()
}
