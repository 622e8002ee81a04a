// =============================================================================
// SuperTrend — ATR bands with a directional flip
// =============================================================================
//
// Basis is the bar midpoint HL2 = (high + low) / 2:
//   upper = HL2 + multiplier * ATR
//   lower = HL2 - multiplier * ATR
//
// While the trend is up the line rides the lower band (ratcheting upward,
// never down); a close below it flips the trend to down, where the line
// rides the upper band (ratcheting downward). Standard parameters:
// period 10, multiplier 3.0. Needs `period + 2` bars.
// =============================================================================

/// Direction of the SuperTrend line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "bullish",
            Self::Down => "bearish",
        }
    }
}

/// SuperTrend output for the most recent bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuperTrendOutput {
    /// The stop-and-reverse line value.
    pub value: f64,
    pub direction: Trend,
    /// Whether the direction flipped on the most recent bar.
    pub flipped: bool,
}

/// Compute the most recent SuperTrend value from parallel OHLC slices.
///
/// Returns `None` when the period is zero, slice lengths differ, or fewer
/// than `period + 2` bars are available.
pub fn latest_supertrend(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    multiplier: f64,
) -> Option<SuperTrendOutput> {
    if period == 0 || high.len() != low.len() || low.len() != close.len() {
        return None;
    }
    let n = close.len();
    if n < period + 2 {
        return None;
    }

    // True range per bar (starting at index 1), then a simple rolling-mean
    // ATR over up to `period` values.
    let mut tr = Vec::with_capacity(n - 1);
    for i in 1..n {
        let hl = high[i] - low[i];
        let hc = (high[i] - close[i - 1]).abs();
        let lc = (low[i] - close[i - 1]).abs();
        tr.push(hl.max(hc).max(lc));
    }

    let mut atr = Vec::with_capacity(tr.len());
    for i in 0..tr.len() {
        let start = i.saturating_sub(period - 1);
        let window = &tr[start..=i];
        atr.push(window.iter().sum::<f64>() / window.len() as f64);
    }

    // Bands aligned with bars 1..n.
    let mut line = f64::NAN;
    let mut trend = Trend::Down;
    let mut prev_trend = trend;

    for (i, &a) in atr.iter().enumerate() {
        let bar = i + 1;
        let hl2 = (high[bar] + low[bar]) / 2.0;
        let upper = hl2 + multiplier * a;
        let lower = hl2 - multiplier * a;
        let price = close[bar];

        if i == 0 {
            if price > upper {
                line = lower;
                trend = Trend::Up;
            } else {
                line = upper;
                trend = Trend::Down;
            }
            prev_trend = trend;
            continue;
        }

        prev_trend = trend;
        match trend {
            Trend::Up => {
                // The lower band ratchets upward; a close below it flips.
                let ratcheted = lower.max(line);
                if price < ratcheted {
                    trend = Trend::Down;
                    line = upper;
                } else {
                    line = ratcheted;
                }
            }
            Trend::Down => {
                let ratcheted = upper.min(line);
                if price > ratcheted {
                    trend = Trend::Up;
                    line = lower;
                } else {
                    line = ratcheted;
                }
            }
        }
    }

    line.is_finite().then_some(SuperTrendOutput {
        value: line,
        direction: trend,
        flipped: trend != prev_trend,
    })
}
