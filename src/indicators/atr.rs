// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR_0 = SMA of the first `period` TR values
// ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Needs `period + 1` bars (ATR-14 needs 15).
// =============================================================================

/// Compute the ATR series from parallel high/low/close slices (oldest first).
///
/// Empty when the period is zero, the slices differ in length, or there are
/// fewer than `period + 1` bars.
pub fn atr_series(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    if period == 0
        || high.len() != low.len()
        || low.len() != close.len()
        || close.len() < period + 1
    {
        return Vec::new();
    }

    let mut tr = Vec::with_capacity(close.len() - 1);
    for i in 1..close.len() {
        let hl = high[i] - low[i];
        let hc = (high[i] - close[i - 1]).abs();
        let lc = (low[i] - close[i - 1]).abs();
        tr.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;
    let seed = tr[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(tr.len() - period + 1);
    out.push(seed);

    let mut prev = seed;
    for &t in &tr[period..] {
        let atr = (prev * (period_f - 1.0) + t) / period_f;
        if !atr.is_finite() {
            break;
        }
        out.push(atr);
        prev = atr;
    }

    out
}

/// Most recent ATR value, or `None` with insufficient data.
pub fn latest_atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Option<f64> {
    atr_series(high, low, close, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bars(n: usize, range: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let close = vec![100.0; n];
        let high = vec![100.0 + range / 2.0; n];
        let low = vec![100.0 - range / 2.0; n];
        (high, low, close)
    }

    #[test]
    fn needs_period_plus_one_bars() {
        let (h, l, c) = flat_bars(14, 2.0);
        assert!(latest_atr(&h, &l, &c, 14).is_none());

        let (h, l, c) = flat_bars(15, 2.0);
        assert!(latest_atr(&h, &l, &c, 14).is_some());
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let (h, mut l, c) = flat_bars(20, 2.0);
        l.pop();
        assert!(atr_series(&h, &l, &c, 14).is_empty());
    }

    #[test]
    fn constant_range_yields_that_range() {
        // Each bar spans exactly 2.0 and closes at the midpoint, so every
        // TR equals the bar range.
        let (h, l, c) = flat_bars(40, 2.0);
        let atr = latest_atr(&h, &l, &c, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_is_non_negative() {
        let close: Vec<f64> = (0..40).map(|x| 100.0 + (x as f64 * 0.9).sin() * 5.0).collect();
        let high: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 1.0).collect();
        for v in atr_series(&high, &low, &close, 14) {
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn gap_expands_true_range() {
        // A large gap between the previous close and the new bar must expand
        // the ATR beyond the plain high-low span.
        let mut high = vec![101.0; 20];
        let mut low = vec![99.0; 20];
        let mut close = vec![100.0; 20];
        high.push(131.0);
        low.push(129.0);
        close.push(130.0);

        let atr = latest_atr(&high, &low, &close, 14).unwrap();
        assert!(atr > 2.0);
    }
}
