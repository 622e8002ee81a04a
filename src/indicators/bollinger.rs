// =============================================================================
// Bollinger Bands
// =============================================================================
//
//   middle = SMA(period)
//   upper  = middle + k * stddev(period)
//   lower  = middle - k * stddev(period)
//
// Derived values:
//   bandwidth = (upper - lower) / middle
//   percent_b = (price - lower) / (upper - lower)
//
// Standard parameters: period 20, k = 2.
// =============================================================================

/// Upper / middle / lower band values for the most recent close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl Bands {
    /// Band width relative to the middle band, or `None` when degenerate.
    pub fn bandwidth(&self) -> Option<f64> {
        (self.middle > 0.0).then(|| (self.upper - self.lower) / self.middle)
    }

    /// Position of `price` inside the bands; 0 at the lower band, 1 at the
    /// upper band. Falls back to 0.5 when the bands have collapsed.
    pub fn percent_b(&self, price: f64) -> f64 {
        if self.upper > self.lower {
            (price - self.lower) / (self.upper - self.lower)
        } else {
            0.5
        }
    }
}

/// Bands over the last `period` closes with deviation multiplier `k`.
///
/// Returns `None` when the input is shorter than `period`, the period is
/// zero, or any output is non-finite.
pub fn bands(closes: &[f64], period: usize, k: f64) -> Option<Bands> {
    bands_at(closes, closes.len(), period, k)
}

/// Bands for the window ending at index `end` (exclusive). Used to rebuild
/// the recent bandwidth history for squeeze detection.
pub fn bands_at(closes: &[f64], end: usize, period: usize, k: f64) -> Option<Bands> {
    if period == 0 || end > closes.len() || end < period {
        return None;
    }

    let window = &closes[end - period..end];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();

    let out = Bands {
        upper: mean + k * sd,
        middle: mean,
        lower: mean - k * sd,
    };

    (out.upper.is_finite() && out.middle.is_finite() && out.lower.is_finite()).then_some(out)
}

/// Bandwidth values for the last `count` windows (oldest first). Windows
/// with insufficient history or a degenerate middle band are skipped.
pub fn recent_bandwidths(closes: &[f64], period: usize, k: f64, count: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = Vec::with_capacity(count);
    let start = n.saturating_sub(count);
    for end in start..n {
        if let Some(bw) = bands_at(closes, end + 1, period, k).and_then(|b| b.bandwidth()) {
            out.push(bw);
        }
    }
    out
}
