// =============================================================================
// Shared types used across the Kestrel trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV candle for a fixed interval.
///
/// Produced by the market data stream, consumed by the indicator buffer,
/// never mutated afterwards. Invariant for accepted klines:
/// `low <= open, close <= high` and `volume >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    /// Interval open time, UNIX milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Whether the interval has closed. The engine only analyses closed
    /// klines; in-progress updates are ignored.
    pub is_closed: bool,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The opposite side (used for protective SL/TP orders).
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("invalid side: {other}")),
        }
    }
}

/// Whether the engine simulates fills locally or trades real funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Record of an executed (or attempted) trade, fed into the risk governor's
/// rolling evaluation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub decision: Side,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub success: bool,
    /// Notional position size in quote currency (USDT).
    pub size: f64,
}

impl TradeRecord {
    /// Provisional record created at order placement, before the position
    /// closes. PnL starts at zero; `success` reflects whether the fill
    /// itself succeeded.
    pub fn provisional(
        trade_id: impl Into<String>,
        symbol: impl Into<String>,
        decision: Side,
        entry_price: f64,
        size: f64,
        success: bool,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            timestamp: Utc::now(),
            symbol: symbol.into(),
            decision,
            entry_price,
            exit_price: None,
            pnl: 0.0,
            pnl_pct: 0.0,
            success,
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_parse() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("HODL".parse::<Side>().is_err());
    }

    #[test]
    fn side_serialises_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
    }

    #[test]
    fn trading_mode_defaults_to_paper() {
        assert_eq!(TradingMode::default(), TradingMode::Paper);
    }

    #[test]
    fn provisional_trade_record_has_zero_pnl() {
        let rec = TradeRecord::provisional("t1", "BTCUSDT", Side::Buy, 37000.0, 100.0, true);
        assert_eq!(rec.pnl, 0.0);
        assert_eq!(rec.pnl_pct, 0.0);
        assert!(rec.exit_price.is_none());
        assert!(rec.success);
    }
}
