// =============================================================================
// Indicator Buffer — bounded OHLCV ring buffers + cached indicator snapshot
// =============================================================================
//
// Thread-safe store of the most recent MAXLEN candles for one instrument,
// plus the latest full indicator snapshot and short sequence buffers for
// selected indicators. All mutating and reading operations are serialised
// under a single mutex.
//
// Indicator policy: every indicator has an explicit minimum-length
// precondition; when it fails the indicator is omitted from the snapshot,
// never defaulted. Indicator failures are local and silent (warning logged,
// rate-limited per indicator).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::indicators::{adx, atr, bollinger, ema, macd, roc, rsi, supertrend};

/// Maximum retained candles per buffer.
pub const MAXLEN: usize = 300;

/// Minimum candles before the snapshot cache is (re)computed.
pub const MIN_CANDLES_FOR_CALC: usize = 30;

/// Minimum candles before the full indicator map is exposed to readers.
pub const MIN_CANDLES_FOR_RELIABLE_CALC: usize = 30;

/// Cooldown between repeated invalid-value warnings for one indicator.
const INDICATOR_WARNING_COOLDOWN: Duration = Duration::from_secs(300);

// =============================================================================
// Snapshot types
// =============================================================================

/// Price location relative to the Bollinger bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BandPosition {
    #[serde(rename = "BELOW_LOWER")]
    BelowLower,
    #[serde(rename = "LOWER")]
    Lower,
    #[serde(rename = "MIDDLE")]
    Middle,
    #[serde(rename = "UPPER")]
    Upper,
    #[serde(rename = "ABOVE_UPPER")]
    AboveUpper,
}

impl BandPosition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BelowLower => "BELOW_LOWER",
            Self::Lower => "LOWER",
            Self::Middle => "MIDDLE",
            Self::Upper => "UPPER",
            Self::AboveUpper => "ABOVE_UPPER",
        }
    }

    /// Classify a percent-b value into a band position.
    pub fn from_percent_b(percent_b: f64) -> Self {
        if percent_b <= 0.0 {
            Self::BelowLower
        } else if percent_b >= 1.0 {
            Self::AboveUpper
        } else if percent_b < 0.2 {
            Self::Lower
        } else if percent_b > 0.8 {
            Self::Upper
        } else {
            Self::Middle
        }
    }
}

/// The latest computed indicator values for one instrument.
///
/// `values` holds only finite scalars; an indicator whose precondition or
/// computation failed is simply absent. The typed flags are derived from
/// the scalar bands deterministically.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndicatorSnapshot {
    pub values: HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band_position: Option<BandPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squeeze: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb_inside_kc: Option<bool>,
    /// "bullish" or "bearish" when the SuperTrend is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supertrend_direction: Option<&'static str>,
}

impl IndicatorSnapshot {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// A snapshot with no scalar values at all — the engine aborts the
    /// cycle on this.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// Buffer internals
// =============================================================================

struct Inner {
    open: VecDeque<f64>,
    high: VecDeque<f64>,
    low: VecDeque<f64>,
    close: VecDeque<f64>,
    volume: VecDeque<f64>,
    open_time: VecDeque<i64>,

    // Short sequences of selected indicators, one value per recompute.
    rsi_seq: VecDeque<f64>,
    macd_line_seq: VecDeque<f64>,
    macd_signal_seq: VecDeque<f64>,
    adx_seq: VecDeque<f64>,
    atr_seq: VecDeque<f64>,

    snapshot: IndicatorSnapshot,
    warned_at: HashMap<&'static str, Instant>,
}

impl Inner {
    fn with_capacity(maxlen: usize) -> Self {
        Self {
            open: VecDeque::with_capacity(maxlen),
            high: VecDeque::with_capacity(maxlen),
            low: VecDeque::with_capacity(maxlen),
            close: VecDeque::with_capacity(maxlen),
            volume: VecDeque::with_capacity(maxlen),
            open_time: VecDeque::with_capacity(maxlen),
            rsi_seq: VecDeque::with_capacity(maxlen),
            macd_line_seq: VecDeque::with_capacity(maxlen),
            macd_signal_seq: VecDeque::with_capacity(maxlen),
            adx_seq: VecDeque::with_capacity(maxlen),
            atr_seq: VecDeque::with_capacity(maxlen),
            snapshot: IndicatorSnapshot::default(),
            warned_at: HashMap::new(),
        }
    }

    /// Warn about an invalid indicator value, at most once per cooldown
    /// window per indicator.
    fn warn_rate_limited(&mut self, name: &'static str) {
        let now = Instant::now();
        let due = self
            .warned_at
            .get(name)
            .map_or(true, |t| now.duration_since(*t) >= INDICATOR_WARNING_COOLDOWN);
        if due {
            warn!(indicator = name, "indicator produced no valid value");
            self.warned_at.insert(name, now);
        }
    }
}

/// Thread-safe bounded buffer of OHLCV data with a cached indicator
/// snapshot, serialised under a single mutex.
pub struct IndicatorBuffer {
    inner: Mutex<Inner>,
    maxlen: usize,
    min_candles: usize,
}

impl IndicatorBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAXLEN)
    }

    pub fn with_capacity(maxlen: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::with_capacity(maxlen)),
            maxlen,
            min_candles: MIN_CANDLES_FOR_CALC,
        }
    }

    /// Number of candles currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Append one candle.
    ///
    /// Rejects (returning `false`, without mutating any buffer) inputs where
    /// any OHLC value is non-finite or non-positive, volume is negative or
    /// non-finite, or `low <= {open, close} <= high` is violated. A missing
    /// open is synthesised from the previous close (clamped into
    /// `[low, high]` so the stored invariant holds); a missing open time
    /// falls back to the wall clock.
    ///
    /// Once at least [`MIN_CANDLES_FOR_CALC`] candles are present the full
    /// snapshot is recomputed; below that the cache is emptied.
    pub fn append(
        &self,
        close: f64,
        high: f64,
        low: f64,
        volume: f64,
        open: Option<f64>,
        open_time: Option<i64>,
    ) -> bool {
        if !Self::validate(close, high, low, volume, open) {
            warn!(close, high, low, volume, "invalid kline rejected");
            return false;
        }

        let mut inner = self.inner.lock();

        let open_value = match open {
            Some(o) => o,
            None => match inner.close.back() {
                // Synthesised open: previous close clamped into this bar's range.
                Some(&prev) => prev.clamp(low, high),
                None => close,
            },
        };

        let ts = open_time.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        inner.open.push_back(open_value);
        inner.high.push_back(high);
        inner.low.push_back(low);
        inner.close.push_back(close);
        inner.volume.push_back(volume);
        inner.open_time.push_back(ts);

        while inner.close.len() > self.maxlen {
            inner.open.pop_front();
            inner.high.pop_front();
            inner.low.pop_front();
            inner.close.pop_front();
            inner.volume.pop_front();
            inner.open_time.pop_front();
        }

        if inner.close.len() >= self.min_candles {
            self.recompute(&mut inner);
        } else {
            inner.snapshot = IndicatorSnapshot::default();
            debug!(
                have = inner.close.len(),
                need = self.min_candles,
                "not enough candles for indicator calculation yet"
            );
        }

        true
    }

    fn validate(close: f64, high: f64, low: f64, volume: f64, open: Option<f64>) -> bool {
        let finite_positive = |v: f64| v.is_finite() && v > 0.0;

        if !finite_positive(close) || !finite_positive(high) || !finite_positive(low) {
            return false;
        }
        if !volume.is_finite() || volume < 0.0 {
            return false;
        }
        if !(low <= close && close <= high) || low > high {
            return false;
        }
        if let Some(o) = open {
            if !finite_positive(o) || !(low <= o && o <= high) {
                return false;
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    /// The latest indicator snapshot.
    ///
    /// With at least one candle the basic keys (`last_price`, `curr_vol`,
    /// `avg_vol_20`, `volume_sma`) are always present; the full map is
    /// exposed only at [`MIN_CANDLES_FOR_RELIABLE_CALC`] candles or more.
    pub fn current_indicators(&self) -> IndicatorSnapshot {
        let inner = self.inner.lock();

        let mut out = IndicatorSnapshot::default();
        let Some(&last_close) = inner.close.back() else {
            return out;
        };
        let last_vol = inner.volume.back().copied().unwrap_or(0.0);

        out.values.insert("last_price".to_string(), last_close);
        out.values.insert("curr_vol".to_string(), last_vol);

        let vol_window = inner.volume.len().min(20);
        if vol_window > 0 {
            let avg: f64 =
                inner.volume.iter().rev().take(vol_window).sum::<f64>() / vol_window as f64;
            out.values.insert("avg_vol_20".to_string(), avg);
            out.values.insert("volume_sma".to_string(), avg);
        }

        if inner.close.len() < MIN_CANDLES_FOR_RELIABLE_CALC {
            debug!(
                have = inner.close.len(),
                need = MIN_CANDLES_FOR_RELIABLE_CALC,
                "returning basic indicator data only"
            );
            return out;
        }

        for (k, v) in &inner.snapshot.values {
            out.values.insert(k.clone(), *v);
        }
        out.band_position = inner.snapshot.band_position;
        out.squeeze = inner.snapshot.squeeze;
        out.bb_inside_kc = inner.snapshot.bb_inside_kc;
        out.supertrend_direction = inner.snapshot.supertrend_direction;

        out
    }

    /// Recent sequences of length exactly `n` for price, volume, and the
    /// tracked indicators. Sequences containing any non-finite value, or
    /// shorter than `n`, are omitted.
    pub fn sequences(&self, n: usize) -> HashMap<String, Vec<f64>> {
        let inner = self.inner.lock();
        let mut out = HashMap::new();

        if n == 0 || inner.close.len() < MIN_CANDLES_FOR_RELIABLE_CALC.max(n) {
            return out;
        }

        let mut take = |name: &str, buf: &VecDeque<f64>| {
            if buf.len() < n {
                return;
            }
            let seq: Vec<f64> = buf.iter().skip(buf.len() - n).copied().collect();
            if seq.iter().all(|v| v.is_finite()) {
                out.insert(name.to_string(), seq);
            }
        };

        take("close_seq", &inner.close);
        take("high_seq", &inner.high);
        take("low_seq", &inner.low);
        take("volume_seq", &inner.volume);
        take("rsi_seq", &inner.rsi_seq);
        take("macd_line_seq", &inner.macd_line_seq);
        take("macd_signal_seq", &inner.macd_signal_seq);
        take("adx_seq", &inner.adx_seq);
        take("atr_seq", &inner.atr_seq);

        out
    }

    /// Drop all candles, sequences, and the snapshot cache.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::with_capacity(self.maxlen);
        debug!("indicator buffer cleared");
    }

    // -------------------------------------------------------------------------
    // Snapshot computation
    // -------------------------------------------------------------------------

    fn recompute(&self, inner: &mut Inner) {
        let close: Vec<f64> = inner.close.iter().copied().collect();
        let high: Vec<f64> = inner.high.iter().copied().collect();
        let low: Vec<f64> = inner.low.iter().copied().collect();
        let volume: Vec<f64> = inner.volume.iter().copied().collect();
        let n = close.len();

        let mut snap = IndicatorSnapshot::default();
        let put = |snap: &mut IndicatorSnapshot, name: &str, value: f64| {
            if value.is_finite() {
                snap.values.insert(name.to_string(), value);
            }
        };

        // --- RSI (14, needs 15) ----------------------------------------------
        if n >= 15 {
            match rsi::latest_rsi(&close, 14) {
                Some(v) => put(&mut snap, "rsi", v),
                None => inner.warn_rate_limited("rsi"),
            }
        }

        // --- MACD (12, 26, 9; needs 34) --------------------------------------
        if n >= 34 {
            match macd::latest_macd(&close, 12, 26, 9) {
                Some(m) => {
                    put(&mut snap, "macd_line", m.line);
                    put(&mut snap, "macd_signal", m.signal);
                    put(&mut snap, "macd_histogram", m.histogram);
                }
                None => inner.warn_rate_limited("macd"),
            }
        }

        // --- EMAs / SMA ------------------------------------------------------
        for (name, period) in [("ema_9", 9usize), ("ema_20", 20), ("ema_21", 21)] {
            if n >= period {
                match ema::latest_ema(&close, period) {
                    Some(v) => put(&mut snap, name, v),
                    None => inner.warn_rate_limited("ema"),
                }
            }
        }
        if n >= 20 {
            if let Some(v) = ema::sma(&close, 20) {
                put(&mut snap, "sma_20", v);
            }
        }
        if n >= 50 {
            if let Some(v) = ema::sma(&close, 50) {
                put(&mut snap, "ma_50", v);
            }
        }

        // --- ATR (14, needs 15) ----------------------------------------------
        if n >= 15 {
            match atr::latest_atr(&high, &low, &close, 14) {
                Some(v) => put(&mut snap, "atr", v),
                None => inner.warn_rate_limited("atr"),
            }
        }

        // --- ADX (14, first value at lookback 27) ----------------------------
        if n >= 27 {
            if let Some(out) = adx::latest_adx(&high, &low, &close, 14) {
                put(&mut snap, "adx", out.adx);
                put(&mut snap, "plus_di", out.plus_di);
                put(&mut snap, "minus_di", out.minus_di);
            }
        }

        // --- ROC (10, needs 11) ----------------------------------------------
        if n >= 11 {
            if let Some(v) = roc::latest_roc(&close, 10) {
                put(&mut snap, "roc", v);
            }
        }

        // --- Bollinger (20, 2) + derived flags -------------------------------
        if n >= 20 {
            if let Some(b) = bollinger::bands(&close, 20, 2.0) {
                put(&mut snap, "bb_upper", b.upper);
                put(&mut snap, "bb_middle", b.middle);
                put(&mut snap, "bb_lower", b.lower);

                let price = close[n - 1];
                let percent_b = b.percent_b(price);
                put(&mut snap, "percent_b", percent_b);
                snap.band_position = Some(BandPosition::from_percent_b(percent_b));

                if let Some(bw) = b.bandwidth() {
                    put(&mut snap, "bandwidth", bw);
                    put(&mut snap, "bandwidth_pct", bw * 100.0);

                    // Squeeze: bandwidth below the 20th percentile of the
                    // last 20 bandwidths.
                    let history = bollinger::recent_bandwidths(&close, 20, 2.0, 20);
                    if let Some(threshold) = percentile(&history, 20.0) {
                        snap.squeeze = Some(bw < threshold);
                    }
                }

                // Keltner channel: EMA20 +/- 1.5 * ATR (prefer ATR-20).
                let kc_mid = ema::latest_ema(&close, 20);
                let kc_atr = atr::latest_atr(&high, &low, &close, 20)
                    .or_else(|| atr::latest_atr(&high, &low, &close, 14));
                if let (Some(mid), Some(a)) = (kc_mid, kc_atr) {
                    let kc_upper = mid + 1.5 * a;
                    let kc_lower = mid - 1.5 * a;
                    put(&mut snap, "keltner_upper", kc_upper);
                    put(&mut snap, "keltner_middle", mid);
                    put(&mut snap, "keltner_lower", kc_lower);
                    snap.bb_inside_kc = Some(b.upper < kc_upper && b.lower > kc_lower);
                }
            } else {
                inner.warn_rate_limited("bollinger");
            }
        }

        // --- SuperTrend (10, 3.0; needs 12) ----------------------------------
        if n >= 12 {
            if let Some(st) = supertrend::latest_supertrend(&high, &low, &close, 10, 3.0) {
                put(&mut snap, "supertrend", st.value);
                snap.supertrend_direction = Some(st.direction.as_str());
            }
        }

        // --- VWAP over the retained window -----------------------------------
        let total_vol: f64 = volume.iter().sum();
        if total_vol > 0.0 {
            let vwap = close
                .iter()
                .zip(volume.iter())
                .map(|(c, v)| c * v)
                .sum::<f64>()
                / total_vol;
            put(&mut snap, "vwap", vwap);
        }

        // --- Sequence buffers -------------------------------------------------
        let maxlen = self.maxlen;
        let mut push_seq = |buf: &mut VecDeque<f64>, value: Option<f64>| {
            if let Some(v) = value {
                buf.push_back(v);
                while buf.len() > maxlen {
                    buf.pop_front();
                }
            }
        };
        push_seq(&mut inner.rsi_seq, snap.get("rsi"));
        push_seq(&mut inner.macd_line_seq, snap.get("macd_line"));
        push_seq(&mut inner.macd_signal_seq, snap.get("macd_signal"));
        push_seq(&mut inner.adx_seq, snap.get("adx"));
        push_seq(&mut inner.atr_seq, snap.get("atr"));

        inner.snapshot = snap;
    }
}

impl Default for IndicatorBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IndicatorBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorBuffer")
            .field("len", &self.len())
            .field("maxlen", &self.maxlen)
            .finish()
    }
}

/// Linear-interpolated percentile of `values` (0–100). `None` when empty.
fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
