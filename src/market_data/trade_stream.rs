// =============================================================================
// Trade Stream Processor — aggregates real-time taker flow
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

/// Processes individual aggregate trades into order-flow metrics.
pub struct TradeStreamProcessor {
    symbol: String,
    /// Cumulative volume delta: taker buy volume minus taker sell volume.
    cvd: RwLock<f64>,
    buy_volume: RwLock<f64>,
    sell_volume: RwLock<f64>,
    trade_count: AtomicU64,
    last_price: RwLock<f64>,
}

impl TradeStreamProcessor {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            cvd: RwLock::new(0.0),
            buy_volume: RwLock::new(0.0),
            sell_volume: RwLock::new(0.0),
            trade_count: AtomicU64::new(0),
            last_price: RwLock::new(0.0),
        }
    }

    /// Fold one trade into the accumulators.
    pub fn process_trade(&self, price: f64, quantity: f64, is_buyer_maker: bool) {
        let volume = price * quantity;

        if is_buyer_maker {
            // Buyer is maker => the taker sold.
            *self.sell_volume.write() += volume;
            *self.cvd.write() -= volume;
        } else {
            // Seller is maker => the taker bought.
            *self.buy_volume.write() += volume;
            *self.cvd.write() += volume;
        }

        *self.last_price.write() = price;
        self.trade_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn cvd(&self) -> f64 {
        *self.cvd.read()
    }

    pub fn last_price(&self) -> f64 {
        *self.last_price.read()
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count.load(Ordering::Relaxed)
    }

    /// Fraction of taker volume that was buying, 0.5 when no flow yet.
    pub fn buy_volume_ratio(&self) -> f64 {
        let buy = *self.buy_volume.read();
        let sell = *self.sell_volume.read();
        let total = buy + sell;
        if total > 0.0 {
            buy / total
        } else {
            0.5
        }
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the futures aggTrade stream for one symbol and feed trades
/// into `processor`. Returns on disconnect so the caller can reconnect.
pub async fn run_trade_stream(
    symbol: &str,
    processor: &Arc<TradeStreamProcessor>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text) {
                        Ok((price, quantity, is_buyer_maker)) => {
                            processor.process_trade(price, quantity, is_buyer_maker);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse an aggTrade message:
/// `{ "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "m": true }`
fn parse_agg_trade(text: &str) -> Result<(f64, f64, bool)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let is_buyer_maker = root["m"].as_bool().context("missing field m")?;

    Ok((price, quantity, is_buyer_maker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taker_buys_push_cvd_up() {
        let tp = TradeStreamProcessor::new("BTCUSDT");
        tp.process_trade(100.0, 2.0, false); // taker bought 200
        tp.process_trade(100.0, 1.0, true); // taker sold 100
        assert!((tp.cvd() - 100.0).abs() < 1e-12);
        assert_eq!(tp.trade_count(), 2);
        assert!((tp.last_price() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn buy_volume_ratio_reflects_flow() {
        let tp = TradeStreamProcessor::new("BTCUSDT");
        assert!((tp.buy_volume_ratio() - 0.5).abs() < 1e-12);

        tp.process_trade(100.0, 3.0, false);
        tp.process_trade(100.0, 1.0, true);
        assert!((tp.buy_volume_ratio() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn parses_agg_trade_message() {
        let msg = r#"{ "e": "aggTrade", "s": "BTCUSDT", "p": "37000.5", "q": "0.25", "m": true }"#;
        let (p, q, m) = parse_agg_trade(msg).unwrap();
        assert!((p - 37_000.5).abs() < f64::EPSILON);
        assert!((q - 0.25).abs() < f64::EPSILON);
        assert!(m);
    }

    #[test]
    fn rejects_malformed_trade() {
        assert!(parse_agg_trade(r#"{ "e": "aggTrade" }"#).is_err());
    }
}
