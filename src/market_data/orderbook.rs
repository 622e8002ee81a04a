// =============================================================================
// Order Book Manager — real-time depth aggregation
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

/// Aggregated orderbook state for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookState {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    /// Spread in basis points of the mid price; `None` when one side is empty.
    pub spread_bps: Option<f64>,
    /// (bid_depth - ask_depth) / (bid_depth + ask_depth), in [-1, +1].
    pub imbalance: f64,
    pub last_update_id: u64,
}

/// Holds the latest orderbook state per symbol.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBookState>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the stored state for a symbol from a fresh depth snapshot.
    pub fn update(
        &self,
        symbol: &str,
        best_bid: f64,
        best_ask: f64,
        bid_depth: f64,
        ask_depth: f64,
        update_id: u64,
    ) {
        let mid = (best_bid + best_ask) / 2.0;
        let spread_bps = (best_bid > 0.0 && best_ask > 0.0 && mid > 0.0)
            .then(|| (best_ask - best_bid) / mid * 10_000.0);

        let total = bid_depth + ask_depth;
        let imbalance = if total > 0.0 {
            (bid_depth - ask_depth) / total
        } else {
            0.0
        };

        self.books.write().insert(
            symbol.to_string(),
            OrderBookState {
                symbol: symbol.to_string(),
                best_bid,
                best_ask,
                bid_depth,
                ask_depth,
                spread_bps,
                imbalance,
                last_update_id: update_id,
            },
        );
    }

    pub fn get(&self, symbol: &str) -> Option<OrderBookState> {
        self.books.read().get(symbol).cloned()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Depth WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the futures partial-depth stream (top 20 levels, 100 ms) for
/// one symbol and feed snapshots into `manager`. Returns on disconnect so
/// the caller can reconnect.
pub async fn run_depth_stream(symbol: &str, manager: &Arc<OrderBookManager>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@depth20@100ms");
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(&text) {
                        Ok((best_bid, best_ask, bid_depth, ask_depth, update_id)) => {
                            manager.update(symbol, best_bid, best_ask, bid_depth, ask_depth, update_id);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse depth message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a partial-depth message.
///
/// Futures streams wrap the book in an event envelope with `b`/`a` arrays;
/// the spot-style `bids`/`asks` shape is accepted as well.
fn parse_depth_message(text: &str) -> Result<(f64, f64, f64, f64, u64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let bids = root
        .get("b")
        .or_else(|| root.get("bids"))
        .and_then(|v| v.as_array())
        .context("missing bids array")?;
    let asks = root
        .get("a")
        .or_else(|| root.get("asks"))
        .and_then(|v| v.as_array())
        .context("missing asks array")?;

    let update_id = root
        .get("u")
        .or_else(|| root.get("lastUpdateId"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let level_price = |level: &serde_json::Value| -> f64 {
        level
            .get(0)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
    };
    let level_qty = |level: &serde_json::Value| -> f64 {
        level
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
    };

    let best_bid = bids.first().map(&level_price).unwrap_or(0.0);
    let best_ask = asks.first().map(&level_price).unwrap_or(0.0);
    let bid_depth: f64 = bids.iter().map(&level_qty).sum();
    let ask_depth: f64 = asks.iter().map(&level_qty).sum();

    Ok((best_bid, best_ask, bid_depth, ask_depth, update_id))
}
