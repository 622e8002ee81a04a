// =============================================================================
// Binance USDT-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed
// requests carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to
// tolerate minor clock drift against the exchange.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use super::{ExchangeClient, OrderAck, OrderInfo, OrderStatus, PositionInfo};
use crate::types::{Kline, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    /// Create a new client against the production futures API.
    ///
    /// # Arguments
    /// * `api_key` — sent as a header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://fapi.binance.com")
    }

    /// Create a client against an alternate base URL (testnet, mocks).
    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "BinanceFuturesClient initialised");

        Self {
            secret: secret.into(),
            base_url,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Send a signed request and parse the JSON body, failing on non-2xx.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance {method} {path} returned {status}: {body}");
        }

        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into f64.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }

    fn ack_from(body: &serde_json::Value) -> OrderAck {
        OrderAck {
            order_id: body.get("orderId").and_then(|v| v.as_u64()),
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    /// POST /fapi/v1/order (signed) — MARKET order.
    #[instrument(skip(self), name = "binance::place_market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let mut params =
            format!("symbol={symbol}&side={side}&type=MARKET&quantity={quantity}");
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!(symbol, %side, quantity, reduce_only, "placing market order");
        let body = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        debug!(symbol, %side, "market order accepted");
        Ok(Self::ack_from(&body))
    }

    /// POST /fapi/v1/order (signed) — conditional STOP_MARKET order.
    #[instrument(skip(self), name = "binance::place_stop_loss_market")]
    async fn place_stop_loss_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&stopPrice={stop_price}"
        );
        if close_position {
            params.push_str("&closePosition=true");
        } else {
            params.push_str(&format!("&quantity={quantity}&reduceOnly=true"));
        }

        let body = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        debug!(symbol, %side, stop_price, "stop-loss order accepted");
        Ok(Self::ack_from(&body))
    }

    /// POST /fapi/v1/order (signed) — conditional TAKE_PROFIT_MARKET order.
    #[instrument(skip(self), name = "binance::place_take_profit_market")]
    async fn place_take_profit_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=TAKE_PROFIT_MARKET&stopPrice={stop_price}"
        );
        if close_position {
            params.push_str("&closePosition=true");
        } else {
            params.push_str(&format!("&quantity={quantity}&reduceOnly=true"));
        }

        let body = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        debug!(symbol, %side, stop_price, "take-profit order accepted");
        Ok(Self::ack_from(&body))
    }

    /// GET /fapi/v1/order (signed).
    #[instrument(skip(self), name = "binance::get_order")]
    async fn get_order(&self, symbol: &str, order_id: u64) -> Result<OrderInfo> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/order", &params)
            .await?;

        let status_str = body["status"].as_str().unwrap_or("");
        let status = OrderStatus::from_exchange(status_str)
            .with_context(|| format!("unknown order status: {status_str}"))?;

        Ok(OrderInfo {
            order_id,
            status,
            avg_price: Self::parse_str_f64(&body["avgPrice"]).unwrap_or(0.0),
            executed_qty: Self::parse_str_f64(&body["executedQty"]).unwrap_or(0.0),
        })
    }

    /// DELETE /fapi/v1/order (signed).
    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    /// DELETE /fapi/v1/allOpenOrders (signed).
    #[instrument(skip(self), name = "binance::cancel_all_open_orders")]
    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        debug!(symbol, "all open orders cancelled");
        Ok(())
    }

    /// GET /fapi/v2/positionRisk (signed), filtered to one symbol.
    #[instrument(skip(self), name = "binance::get_position")]
    async fn get_position(&self, symbol: &str) -> Result<PositionInfo> {
        let params = format!("symbol={symbol}");
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;

        let entry = body
            .as_array()
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if entry.is_null() {
            warn!(symbol, "no position entry returned — treating as flat");
            return Ok(PositionInfo::default());
        }

        Ok(PositionInfo {
            position_amt: Self::parse_str_f64(&entry["positionAmt"]).unwrap_or(0.0),
            entry_price: Self::parse_str_f64(&entry["entryPrice"]).unwrap_or(0.0),
            unrealized_pnl: Self::parse_str_f64(&entry["unRealizedProfit"]).unwrap_or(0.0),
        })
    }

    /// GET /fapi/v2/balance (signed) — free USDT balance.
    #[instrument(skip(self), name = "binance::get_balance_usdt")]
    async fn get_balance_usdt(&self) -> Result<f64> {
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/balance", "")
            .await?;

        let balances = body
            .as_array()
            .context("balance response is not an array")?;

        for b in balances {
            if b["asset"].as_str() == Some("USDT") {
                let free = Self::parse_str_f64(&b["availableBalance"])
                    .or_else(|_| Self::parse_str_f64(&b["balance"]))
                    .unwrap_or(0.0);
                debug!(free, "USDT balance retrieved");
                return Ok(free);
            }
        }

        warn!("USDT not found in balances — returning 0.0");
        Ok(0.0)
    }

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
    /// [5] volume, [6] closeTime, ...
    #[instrument(skip(self), name = "binance::get_klines")]
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/klines returned {status}: {body}");
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut klines = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            klines.push(Kline {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
                // Historical REST klines are complete intervals.
                is_closed: true,
            });
        }

        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    /// GET /fapi/v1/ticker/price (public).
    #[instrument(skip(self), name = "binance::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/ticker/price request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/ticker/price returned {status}: {body}");
        }

        Self::parse_str_f64(&body["price"])
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceFuturesClient::new("key", "secret");
        let sig1 = client.sign("symbol=BTCUSDT&side=BUY");
        let sig2 = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_secrets_sign_differently() {
        let a = BinanceFuturesClient::new("key", "secret-a");
        let b = BinanceFuturesClient::new("key", "secret-b");
        assert_ne!(a.sign("q=1"), b.sign("q=1"));
    }

    #[test]
    fn signed_query_contains_required_fields() {
        let client = BinanceFuturesClient::new("key", "secret");
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert_eq!(
            BinanceFuturesClient::parse_str_f64(&serde_json::json!("37000.5")).unwrap(),
            37000.5
        );
        assert_eq!(
            BinanceFuturesClient::parse_str_f64(&serde_json::json!(42.0)).unwrap(),
            42.0
        );
        assert!(BinanceFuturesClient::parse_str_f64(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let client = BinanceFuturesClient::new("key", "super-secret");
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
