//! Uniform resampling and magnitude-spectrum reduction for vibration channels

use crate::config::FrequencyBand;
use crate::models::{Sample, Timestamp};
use rustfft::num_complex::Complex;
use rustfft::Fft;

/// Spectral features of one channel, amplitudes normalized by sample count
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralSummary {
    pub centroid_hz: f64,
    pub dominant_hz: f64,
    pub dominant_magnitude: f64,
    /// Share of spectral energy per configured band, in band order
    pub band_ratios: Vec<f64>,
}

/// Resample present samples onto `start + i * interval` for `i in 0..n`
///
/// Interior gaps are bridged by linear interpolation and window edges are
/// held at the nearest sample, both only up to `max_gap` milliseconds.
pub fn resample_uniform(
    samples: &[Sample],
    start: Timestamp,
    interval: i64,
    n: usize,
    max_gap: i64,
) -> Result<Vec<f64>, String> {
    let points: Vec<(Timestamp, f64)> = samples
        .iter()
        .filter_map(|s| s.value.map(|v| (s.timestamp, v)))
        .collect();

    let mut grid = Vec::with_capacity(n);
    let mut next = 0;
    for i in 0..n {
        let t = start + i as i64 * interval;
        while next < points.len() && points[next].0 < t {
            next += 1;
        }
        let before = next.checked_sub(1).map(|j| points[j]);
        let after = points.get(next).copied();

        let value = match (before, after) {
            (_, Some((ta, va))) if ta == t => va,
            (Some((tb, vb)), Some((ta, va))) => {
                if ta - tb > max_gap {
                    return Err(format!("gap of {}ms at {} exceeds {}ms", ta - tb, tb, max_gap));
                }
                let frac = (t - tb) as f64 / (ta - tb) as f64;
                vb + (va - vb) * frac
            }
            (Some((tb, vb)), None) => {
                if t - tb > max_gap {
                    return Err(format!("trailing gap of {}ms exceeds {}ms", t - tb, max_gap));
                }
                vb
            }
            (None, Some((ta, va))) => {
                if ta - t > max_gap {
                    return Err(format!("leading gap of {}ms exceeds {}ms", ta - t, max_gap));
                }
                va
            }
            (None, None) => return Err("no samples to resample".to_string()),
        };
        grid.push(value);
    }
    Ok(grid)
}

/// Reduce a uniformly sampled signal to centroid, dominant peak and band ratios
///
/// `fft` must be planned for `signal.len()`. The mean is removed first so the
/// DC bin never dominates.
pub fn summarize(
    fft: &dyn Fft<f64>,
    signal: &[f64],
    sample_rate_hz: f64,
    bands: &[FrequencyBand],
) -> SpectralSummary {
    let n = signal.len();
    let mut summary = SpectralSummary {
        centroid_hz: 0.0,
        dominant_hz: 0.0,
        dominant_magnitude: 0.0,
        band_ratios: vec![0.0; bands.len()],
    };
    if n < 2 {
        return summary;
    }

    let mean = signal.iter().sum::<f64>() / n as f64;
    let mut buffer: Vec<Complex<f64>> = signal
        .iter()
        .map(|&x| Complex::new(x - mean, 0.0))
        .collect();
    fft.process(&mut buffer);

    let bin_hz = sample_rate_hz / n as f64;
    let (mut weighted, mut total_amp, mut total_energy) = (0.0, 0.0, 0.0);
    let mut band_energy = vec![0.0; bands.len()];

    for (k, bin) in buffer.iter().enumerate().take(n / 2 + 1).skip(1) {
        let amplitude = 2.0 * bin.norm() / n as f64;
        let freq = k as f64 * bin_hz;
        weighted += freq * amplitude;
        total_amp += amplitude;
        total_energy += amplitude * amplitude;
        if amplitude > summary.dominant_magnitude {
            summary.dominant_magnitude = amplitude;
            summary.dominant_hz = freq;
        }
        for (energy, band) in band_energy.iter_mut().zip(bands) {
            if band.contains(freq) {
                *energy += amplitude * amplitude;
            }
        }
    }

    if total_amp > 0.0 {
        summary.centroid_hz = weighted / total_amp;
    }
    if total_energy > 0.0 {
        summary.band_ratios = band_energy.iter().map(|e| e / total_energy).collect();
    }
    summary
}
