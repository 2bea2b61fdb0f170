//! Audio highlight analysis: framed energy and peak selection

pub mod detector;
pub mod energy;

pub use detector::{detect_samples, synthesize_fallback, DetectionOutcome, HighlightDetector, SampleDetection};
pub use energy::{frame_energies, mean_and_std, percentile};
