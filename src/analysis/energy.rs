//! Short-time energy of a mono waveform

/// Frame energies `E[i] = sum(x[i*hop .. i*hop + frame]^2)` for every full frame.
///
/// Frames are never padded and a trailing partial frame is dropped, so the
/// result has `(n - frame) / hop + 1` entries, or none when `n < frame`.
/// Uses a running prefix sum of squares, so the cost is linear in the
/// number of samples regardless of the frame/hop overlap.
pub fn frame_energies(samples: &[f32], frame_length: usize, hop_length: usize) -> Vec<f64> {
    if frame_length == 0 || hop_length == 0 || samples.len() < frame_length {
        return Vec::new();
    }

    let frame_count = (samples.len() - frame_length) / hop_length + 1;

    let mut prefix = Vec::with_capacity(samples.len() + 1);
    prefix.push(0.0f64);
    let mut acc = 0.0f64;
    for &s in samples {
        let s = s as f64;
        acc += s * s;
        prefix.push(acc);
    }

    (0..frame_count)
        .map(|i| {
            let start = i * hop_length;
            // Clamp tiny negative values caused by float cancellation
            (prefix[start + frame_length] - prefix[start]).max(0.0)
        })
        .collect()
}

/// Convert a frame index into a time offset in seconds
pub fn frame_time(index: usize, hop_length: usize, sample_rate: u32) -> f64 {
    index as f64 * hop_length as f64 / sample_rate as f64
}

/// Linear-interpolated percentile (0..=100) of an unsorted sequence.
///
/// Matches the conventional "linear" definition: rank `p/100 * (n-1)`.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(percentile_of_sorted(&sorted, p))
}

/// Percentile over an already ascending-sorted slice
pub fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Mean and population standard deviation
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_energies(samples: &[f32], frame: usize, hop: usize) -> Vec<f64> {
        let mut out = Vec::new();
        let mut start = 0;
        while start + frame <= samples.len() {
            out.push(samples[start..start + frame].iter().map(|&s| (s as f64).powi(2)).sum());
            start += hop;
        }
        out
    }

    #[test]
    fn test_shorter_than_frame_is_empty() {
        assert!(frame_energies(&[1.0; 99], 100, 50).is_empty());
        assert!(frame_energies(&[], 100, 50).is_empty());
    }

    #[test]
    fn test_exact_frame_gives_single_energy() {
        let energies = frame_energies(&[0.5; 100], 100, 50);
        assert_eq!(energies.len(), 1);
        assert!((energies[0] - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_frame_count_drops_partial_tail() {
        // 1000 samples, frame 100, hop 50 => (1000 - 100) / 50 + 1 = 19 frames
        assert_eq!(frame_energies(&vec![0.1; 1000], 100, 50).len(), 19);
        // one extra sample is not enough for another frame
        assert_eq!(frame_energies(&vec![0.1; 1049], 100, 50).len(), 19);
        assert_eq!(frame_energies(&vec![0.1; 1050], 100, 50).len(), 20);
    }

    #[test]
    fn test_prefix_sum_matches_naive_windows() {
        let samples: Vec<f32> = (0..5000).map(|i| ((i as f32) * 0.013).sin() * (i % 7) as f32 * 0.1).collect();
        let fast = frame_energies(&samples, 160, 80);
        let slow = naive_energies(&samples, 160, 80);

        assert_eq!(fast.len(), slow.len());
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_energies_are_non_negative() {
        let samples: Vec<f32> = (0..3000).map(|i| if i % 2 == 0 { 1e-4 } else { -1e-4 }).collect();
        assert!(frame_energies(&samples, 100, 30).iter().all(|&e| e >= 0.0));
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 50.0), Some(3.0));
        assert_eq!(percentile(&values, 100.0), Some(5.0));
        assert!((percentile(&values, 95.0).unwrap() - 4.8).abs() < 1e-12);
        assert_eq!(percentile(&[], 90.0), None);
    }

    #[test]
    fn test_mean_and_std() {
        let (mean, std) = mean_and_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((std - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_frame_time() {
        assert!((frame_time(400, 800, 16000) - 20.0).abs() < 1e-12);
    }
}
