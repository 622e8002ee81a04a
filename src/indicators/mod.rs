// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators consumed by the
// indicator buffer. Every public function returns `Option<T>` or a possibly
// empty `Vec` so callers are forced to handle insufficient-data and
// numerical-edge-case scenarios; an indicator that cannot be computed is
// omitted, never defaulted.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod roc;
pub mod rsi;
pub mod supertrend;
