//! Time-domain statistics over the non-missing samples of a channel

/// Suffixes of the per-channel time-domain features, in schema order
pub const TIME_FEATURES: [&str; 8] = [
    "mean",
    "std",
    "min",
    "max",
    "ptp",
    "rms",
    "skewness",
    "kurtosis",
];

/// Below this central moment the distribution is treated as constant
const DEGENERATE_VARIANCE: f64 = 1e-18;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeStats {
    pub mean: f64,
    /// Sample standard deviation (n - 1 denominator)
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub peak_to_peak: f64,
    pub rms: f64,
    pub skewness: f64,
    /// Excess kurtosis (normal distribution is 0)
    pub kurtosis: f64,
}

impl TimeStats {
    /// Two-pass moments in double precision; `None` for an empty slice
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;

        let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum_sq = 0.0;
        for &v in values {
            let d = v - mean;
            let d2 = d * d;
            m2 += d2;
            m3 += d2 * d;
            m4 += d2 * d2;
            min = min.min(v);
            max = max.max(v);
            sum_sq += v * v;
        }

        let std = if values.len() > 1 {
            (m2 / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        let (m2, m3, m4) = (m2 / n, m3 / n, m4 / n);
        let (skewness, kurtosis) = if m2 > DEGENERATE_VARIANCE {
            (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
        } else {
            (0.0, 0.0)
        };

        Some(Self {
            mean,
            std,
            min,
            max,
            peak_to_peak: max - min,
            rms: (sum_sq / n).sqrt(),
            skewness,
            kurtosis,
        })
    }

    /// Values in [`TIME_FEATURES`] order
    pub fn to_array(&self) -> [f64; 8] {
        [
            self.mean,
            self.std,
            self.min,
            self.max,
            self.peak_to_peak,
            self.rms,
            self.skewness,
            self.kurtosis,
        ]
    }
}
