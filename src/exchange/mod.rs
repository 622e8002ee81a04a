// =============================================================================
// Exchange contract — the order/market-data surface the engine consumes
// =============================================================================
//
// The engine never talks to an exchange SDK directly; it goes through this
// trait. Implementations raise on transport errors and return structured
// values on success. Conditional SL/TP orders are exchange-side algo orders;
// `close_position` requests exchange-side position closure.
// =============================================================================

pub mod binance;

pub use binance::BinanceFuturesClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Kline, Side};

/// Terminal and non-terminal order states reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PARTIALLY_FILLED")]
    PartiallyFilled,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "EXPIRED")]
    Expired,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl OrderStatus {
    /// Whether the exchange will never fill this order further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Expired | Self::Rejected)
    }

    pub fn from_exchange(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "EXPIRED" => Some(Self::Expired),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Acknowledgement returned when an order is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    /// Exchange-assigned order id; absence is treated as failure upstream.
    pub order_id: Option<u64>,
}

/// Current state of a previously placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: u64,
    pub status: OrderStatus,
    pub avg_price: f64,
    pub executed_qty: f64,
}

/// Net position for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionInfo {
    /// Signed position size (negative = short).
    pub position_amt: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// The exchange operations the core consumes.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck>;

    async fn place_stop_loss_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderAck>;

    async fn place_take_profit_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderAck>;

    async fn get_order(&self, symbol: &str, order_id: u64) -> Result<OrderInfo>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()>;

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()>;

    async fn get_position(&self, symbol: &str) -> Result<PositionInfo>;

    async fn get_balance_usdt(&self) -> Result<f64>;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;

    async fn get_ticker(&self, symbol: &str) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn status_roundtrips_through_exchange_strings() {
        for s in ["NEW", "PARTIALLY_FILLED", "FILLED", "CANCELED", "EXPIRED", "REJECTED"] {
            let status = OrderStatus::from_exchange(s).unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!(OrderStatus::from_exchange("PENDING_WHATEVER").is_none());
    }
}
