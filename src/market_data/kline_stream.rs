// =============================================================================
// Kline WebSocket stream — Binance USDT-M futures
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::QuoteState;
use crate::types::Kline;

/// Connect to the futures kline WebSocket stream for one (symbol, interval)
/// and publish **closed** klines into `tx`. Every update (closed or not)
/// refreshes the quote state so `current_price` stays live between closes.
///
/// Runs until the stream disconnects or errors, then returns so the caller
/// can handle reconnection.
pub async fn run_kline_stream(
    symbol: &str,
    interval: &str,
    tx: &broadcast::Sender<Kline>,
    quote: &Arc<QuoteState>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@kline_{interval}");
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text) {
                        Ok(kline) => {
                            *quote.last_price.write() = kline.close;
                            *quote.last_volume.write() = kline.volume;

                            if kline.is_closed {
                                debug!(
                                    open_time = kline.open_time,
                                    close = kline.close,
                                    "closed kline received"
                                );
                                // Send fails only when no subscriber exists yet.
                                let _ = tx.send(kline);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse kline message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a single-stream kline message.
///
/// Expected shape (combined-stream envelopes are unwrapped transparently):
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": ..., "o": "...", "x": false } }
/// ```
fn parse_kline_message(text: &str) -> Result<Kline> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = &data["k"];
    if k.is_null() {
        anyhow::bail!("message has no kline payload");
    }

    Ok(Kline {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
