// =============================================================================
// Average Directional Index (ADX) with +DI / -DI
// =============================================================================
//
// Measures trend strength regardless of direction.
//
//   +DM = max(H_t - H_{t-1}, 0)  when it exceeds the down-move, else 0
//   -DM = max(L_{t-1} - L_t, 0)  when it exceeds the up-move, else 0
//   +DI = 100 * Wilder(+DM) / ATR
//   -DI = 100 * Wilder(-DM) / ATR
//   DX  = 100 * |+DI - -DI| / (+DI + -DI)
//   ADX = Wilder-smoothed DX
//
// The first ADX value appears after a lookback of 2 * period - 1 bars (index
// 27 for the standard period of 14, i.e. the 28th bar).
//
// Interpretation: ADX > 25 trending, ADX < 20 ranging.
// =============================================================================

/// ADX output for the most recent bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxOutput {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Compute the most recent ADX / +DI / -DI from parallel OHLC slices.
///
/// Returns `None` when the period is zero, slice lengths differ, or fewer
/// than `2 * period` bars are available (the smoothing needs `period` DX
/// values, each of which needs `period + 1` bars of history).
pub fn latest_adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Option<AdxOutput> {
    if period == 0 || high.len() != low.len() || low.len() != close.len() {
        return None;
    }
    let n = close.len();
    if n < 2 * period {
        return None;
    }

    // --- Raw directional movement and true range per bar ---------------------
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    let mut tr = Vec::with_capacity(n - 1);

    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];

        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });

        let hl = high[i] - low[i];
        let hc = (high[i] - close[i - 1]).abs();
        let lc = (low[i] - close[i - 1]).abs();
        tr.push(hl.max(hc).max(lc));
    }

    // --- Wilder-smoothed sums -------------------------------------------------
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr[..period].iter().sum();

    let di_pair = |p: f64, m: f64, t: f64| -> Option<(f64, f64)> {
        if t <= 0.0 {
            return None;
        }
        Some((100.0 * p / t, 100.0 * m / t))
    };

    let dx_of = |pdi: f64, mdi: f64| -> f64 {
        let sum = pdi + mdi;
        if sum == 0.0 {
            0.0
        } else {
            100.0 * (pdi - mdi).abs() / sum
        }
    };

    let (mut pdi, mut mdi) = di_pair(sm_plus, sm_minus, sm_tr)?;
    let mut dx_values = vec![dx_of(pdi, mdi)];

    for i in period..tr.len() {
        sm_plus = sm_plus - sm_plus / period as f64 + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period as f64 + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period as f64 + tr[i];

        let (p, m) = di_pair(sm_plus, sm_minus, sm_tr)?;
        pdi = p;
        mdi = m;
        dx_values.push(dx_of(pdi, mdi));
    }

    if dx_values.len() < period {
        return None;
    }

    // --- ADX: Wilder smoothing of DX -----------------------------------------
    let mut adx = dx_values[..period].iter().sum::<f64>() / period as f64;
    for &dx in &dx_values[period..] {
        adx = (adx * (period as f64 - 1.0) + dx) / period as f64;
    }

    (adx.is_finite() && pdi.is_finite() && mdi.is_finite()).then_some(AdxOutput {
        adx,
        plus_di: pdi,
        minus_di: mdi,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trending_up(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let close: Vec<f64> = (0..n).map(|x| 100.0 + x as f64).collect();
        let high: Vec<f64> = close.iter().map(|c| c + 0.5).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 0.5).collect();
        (high, low, close)
    }

    #[test]
    fn needs_27_bars_for_period_14() {
        let (h, l, c) = trending_up(27);
        assert!(latest_adx(&h, &l, &c, 14).is_none());

        let (h, l, c) = trending_up(28);
        assert!(latest_adx(&h, &l, &c, 14).is_some());
    }

    #[test]
    fn strong_uptrend_has_high_adx_and_plus_di_dominance() {
        let (h, l, c) = trending_up(60);
        let out = latest_adx(&h, &l, &c, 14).unwrap();
        assert!(out.adx > 25.0, "uptrend ADX should read trending, got {}", out.adx);
        assert!(out.plus_di > out.minus_di);
    }

    #[test]
    fn strong_downtrend_has_minus_di_dominance() {
        let close: Vec<f64> = (0..60).map(|x| 200.0 - x as f64).collect();
        let high: Vec<f64> = close.iter().map(|c| c + 0.5).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 0.5).collect();
        let out = latest_adx(&high, &low, &close, 14).unwrap();
        assert!(out.minus_di > out.plus_di);
    }

    #[test]
    fn output_is_bounded() {
        let close: Vec<f64> = (0..80).map(|x| 100.0 + (x as f64 * 0.7).sin() * 3.0).collect();
        let high: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 1.0).collect();
        let out = latest_adx(&high, &low, &close, 14).unwrap();
        assert!((0.0..=100.0).contains(&out.adx));
        assert!((0.0..=100.0).contains(&out.plus_di));
        assert!((0.0..=100.0).contains(&out.minus_di));
    }
}
