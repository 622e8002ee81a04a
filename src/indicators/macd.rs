// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line   = EMA(fast) - EMA(slow)
// Signal line = EMA(signal) of the MACD line
// Histogram   = MACD line - signal line
//
// With the standard (12, 26, 9) parameters the first signal value needs
// 26 + 9 - 1 = 34 closes.
// =============================================================================

use super::ema::ema_series;

/// The three MACD outputs for the most recent close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the full (macd_line, signal_line) series pair.
///
/// Both series are aligned to each other: index 0 of each corresponds to the
/// first close for which the signal line exists. Empty when the input is too
/// short or parameters are degenerate (fast >= slow, zero periods).
pub fn macd_series(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<f64>, Vec<f64>) {
    if fast == 0 || signal == 0 || fast >= slow || closes.len() < slow + signal - 1 {
        return (Vec::new(), Vec::new());
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    if slow_ema.is_empty() {
        return (Vec::new(), Vec::new());
    }

    // Align: fast EMA starts `slow - fast` elements earlier than the slow one.
    let offset = slow - fast;
    let line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .filter_map(|(i, &s)| fast_ema.get(i + offset).map(|&f| f - s))
        .collect();

    let signal_line = ema_series(&line, signal);
    if signal_line.is_empty() {
        return (Vec::new(), Vec::new());
    }

    // Trim the MACD line to the span covered by the signal line.
    let trimmed: Vec<f64> = line[line.len() - signal_line.len()..].to_vec();

    (trimmed, signal_line)
}

/// Most recent MACD line / signal / histogram triple.
pub fn latest_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdOutput> {
    let (line, sig) = macd_series(closes, fast, slow, signal);
    let l = *line.last()?;
    let s = *sig.last()?;
    let h = l - s;
    (l.is_finite() && s.is_finite() && h.is_finite()).then_some(MacdOutput {
        line: l,
        signal: s,
        histogram: h,
    })
}
