// =============================================================================
// Order Executor — market orders with protective SL/TP behind a circuit
// breaker
// =============================================================================
//
// The breaker is a CLOSED -> OPEN -> HALF_OPEN state machine per symbol:
// five consecutive failures open it, refusing new orders for 60 s; after the
// window one trial order runs half-open — success closes the breaker,
// failure re-opens it.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::exchange::{ExchangeClient, OrderStatus};
use crate::types::Side;

/// Consecutive failures that open the breaker.
const FAILURE_THRESHOLD: u32 = 5;
/// Seconds the breaker stays open before allowing a trial order.
const RESET_TIMEOUT_SECS: u64 = 60;

/// Fill-poll budget: attempts x delay.
const FILL_POLL_ATTEMPTS: u32 = 10;
const FILL_POLL_DELAY_MS: u64 = 500;

// =============================================================================
// Circuit breaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Short-circuits calls to a failing dependency until a recovery window
/// elapses.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            reset_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call may proceed right now. Transitions OPEN -> HALF_OPEN
    /// when the reset window has elapsed; only one trial call runs
    /// half-open at a time.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::MAX, |t| t.elapsed());
                if elapsed >= self.reset_timeout {
                    info!("circuit breaker half-open — allowing trial order");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("circuit breaker closed after successful call");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;

        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failures >= self.failure_threshold,
            BreakerState::Open => false,
        };

        if should_open {
            warn!(failures = inner.failures, "circuit breaker OPEN");
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, Duration::from_secs(RESET_TIMEOUT_SECS))
    }
}

// =============================================================================
// Execution result
// =============================================================================

/// Terminal status of an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "FILLED_WITH_PROTECTION")]
    FilledWithProtection,
    #[serde(rename = "CIRCUIT_BREAKER_OPEN")]
    CircuitBreakerOpen,
    #[serde(rename = "INVALID_QUANTITY")]
    InvalidQuantity,
    #[serde(rename = "NO_ORDER_ID")]
    NoOrderId,
    #[serde(rename = "NOT_FILLED")]
    NotFilled,
    #[serde(rename = "ERROR")]
    Error,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Filled => "FILLED",
            Self::FilledWithProtection => "FILLED_WITH_PROTECTION",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::InvalidQuantity => "INVALID_QUANTITY",
            Self::NoOrderId => "NO_ORDER_ID",
            Self::NotFilled => "NOT_FILLED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Outcome of one `execute_market_order` call.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub order_id: Option<u64>,
    pub entry_price: f64,
    pub executed_qty: f64,
    pub sl_order_id: Option<u64>,
    pub tp_order_id: Option<u64>,
    pub message: String,
    pub timestamp: String,
}

impl OrderResult {
    fn failure(status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            order_id: None,
            entry_price: 0.0,
            executed_qty: 0.0,
            sl_order_id: None,
            tp_order_id: None,
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Executes market orders with optional protective orders on one symbol.
pub struct OrderExecutor {
    symbol: String,
    qty_precision: usize,
    client: Arc<dyn ExchangeClient>,
    breaker: CircuitBreaker,
}

impl OrderExecutor {
    pub fn new(symbol: impl Into<String>, client: Arc<dyn ExchangeClient>) -> Self {
        Self {
            symbol: symbol.into(),
            qty_precision: 3,
            client,
            breaker: CircuitBreaker::default(),
        }
    }

    /// Override the symbol's quantity precision (exchange lot size).
    pub fn with_qty_precision(mut self, precision: usize) -> Self {
        self.qty_precision = precision;
        self
    }

    #[cfg(test)]
    fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Round a raw quantity down to the symbol's precision.
    fn format_quantity(&self, qty: f64) -> f64 {
        let factor = 10f64.powi(self.qty_precision as i32);
        (qty * factor).floor() / factor
    }

    /// Execute a MARKET order with optional protective SL/TP.
    ///
    /// Steps:
    /// 1. Quantity is formatted to symbol precision; zero fails.
    /// 2. The MARKET order is placed; a missing order id fails.
    /// 3. The fill is polled up to 10 times at 0.5 s; terminal non-FILLED
    ///    statuses fail.
    /// 4. Unless `reduce_only`, when both stop loss and take profit were
    ///    given, reduce-only STOP_MARKET and TAKE_PROFIT_MARKET orders are
    ///    placed on the opposite side. Their failure is logged but does not
    ///    fail the parent result.
    pub async fn execute_market_order(
        &self,
        side: Side,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        reduce_only: bool,
    ) -> OrderResult {
        let timestamp = Utc::now().to_rfc3339();

        if !self.breaker.try_acquire() {
            return OrderResult::failure(
                ExecutionStatus::CircuitBreakerOpen,
                "circuit breaker is open due to recent failures",
            );
        }

        // -- Step 1: quantity ---------------------------------------------------
        let qty = self.format_quantity(quantity);
        if qty <= 0.0 {
            // Not an exchange failure; the breaker state is left untouched,
            // but a half-open trial slot must not leak.
            self.breaker.record_success();
            return OrderResult::failure(
                ExecutionStatus::InvalidQuantity,
                format!("quantity {quantity} formats to zero"),
            );
        }

        info!(symbol = %self.symbol, %side, qty, reduce_only, "executing MARKET order");

        // -- Step 2: placement --------------------------------------------------
        let ack = match self
            .client
            .place_market_order(&self.symbol, side, qty, reduce_only)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.breaker.record_failure();
                error!(symbol = %self.symbol, error = %e, "market order placement failed");
                return OrderResult::failure(ExecutionStatus::Error, e.to_string());
            }
        };

        let Some(order_id) = ack.order_id else {
            self.breaker.record_failure();
            return OrderResult::failure(
                ExecutionStatus::NoOrderId,
                "market order failed to return an order id",
            );
        };

        // -- Step 3: fill polling -----------------------------------------------
        let filled = match self.wait_for_fill(order_id).await {
            Some(info) if info.status == OrderStatus::Filled => info,
            other => {
                self.breaker.record_failure();
                let status = other.map(|o| o.status.to_string());
                warn!(
                    symbol = %self.symbol,
                    order_id,
                    status = status.as_deref().unwrap_or("unknown"),
                    "order did not fill"
                );
                let mut result = OrderResult::failure(
                    ExecutionStatus::NotFilled,
                    format!("order status: {}", status.as_deref().unwrap_or("unknown")),
                );
                result.order_id = Some(order_id);
                return result;
            }
        };

        info!(
            symbol = %self.symbol,
            %side,
            qty = filled.executed_qty,
            price = filled.avg_price,
            "MARKET order FILLED"
        );

        // -- Step 4: protective orders ------------------------------------------
        let mut sl_order_id = None;
        let mut tp_order_id = None;

        if !reduce_only {
            if let (Some(sl), Some(tp)) = (stop_loss, take_profit) {
                (sl_order_id, tp_order_id) = self
                    .place_protective_orders(side, filled.executed_qty, sl, tp)
                    .await;
            }
        }

        self.breaker.record_success();

        OrderResult {
            success: true,
            status: if sl_order_id.is_some() {
                ExecutionStatus::FilledWithProtection
            } else {
                ExecutionStatus::Filled
            },
            order_id: Some(order_id),
            entry_price: filled.avg_price,
            executed_qty: filled.executed_qty,
            sl_order_id,
            tp_order_id,
            message: "order executed successfully".to_string(),
            timestamp,
        }
    }

    /// Poll the order until FILLED, a terminal status, or the retry budget
    /// runs out.
    async fn wait_for_fill(&self, order_id: u64) -> Option<crate::exchange::OrderInfo> {
        for _ in 0..FILL_POLL_ATTEMPTS {
            match self.client.get_order(&self.symbol, order_id).await {
                Ok(info) => {
                    if info.status.is_terminal() {
                        return Some(info);
                    }
                }
                Err(e) => {
                    error!(order_id, error = %e, "error checking order status");
                }
            }
            tokio::time::sleep(Duration::from_millis(FILL_POLL_DELAY_MS)).await;
        }
        None
    }

    /// Place reduce-only SL and TP conditional orders on the opposite side.
    /// Failures are logged, never propagated.
    async fn place_protective_orders(
        &self,
        entry_side: Side,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> (Option<u64>, Option<u64>) {
        let exit_side = entry_side.opposite();
        let qty = self.format_quantity(quantity);

        let sl_order_id = match self
            .client
            .place_stop_loss_market(&self.symbol, exit_side, qty, stop_loss, false)
            .await
        {
            Ok(ack) => {
                debug!(symbol = %self.symbol, stop_loss, order_id = ?ack.order_id, "SL placed");
                ack.order_id
            }
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "failed to place stop loss");
                None
            }
        };

        let tp_order_id = match self
            .client
            .place_take_profit_market(&self.symbol, exit_side, qty, take_profit, false)
            .await
        {
            Ok(ack) => {
                debug!(symbol = %self.symbol, take_profit, order_id = ?ack.order_id, "TP placed");
                ack.order_id
            }
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "failed to place take profit");
                None
            }
        };

        (sl_order_id, tp_order_id)
    }

    /// Cancel all open orders for this symbol (used on shutdown paths).
    pub async fn cancel_all_orders(&self) -> bool {
        match self.client.cancel_all_open_orders(&self.symbol).await {
            Ok(()) => {
                info!(symbol = %self.symbol, "all open orders cancelled");
                true
            }
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "failed to cancel open orders");
                false
            }
        }
    }

    pub async fn get_balance(&self) -> Option<f64> {
        match self.client.get_balance_usdt().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                error!(error = %e, "failed to fetch balance");
                None
            }
        }
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("symbol", &self.symbol)
            .field("qty_precision", &self.qty_precision)
            .field("breaker_state", &self.breaker.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderAck, OrderInfo, PositionInfo};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted exchange double that records call counts.
    struct MockExchange {
        fail_placement: bool,
        omit_order_id: bool,
        fill_status: OrderStatus,
        fail_protective: bool,
        market_calls: AtomicU32,
        protective_calls: AtomicU32,
    }

    impl MockExchange {
        fn filled() -> Self {
            Self {
                fail_placement: false,
                omit_order_id: false,
                fill_status: OrderStatus::Filled,
                fail_protective: false,
                market_calls: AtomicU32::new(0),
                protective_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn place_market_order(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: f64,
            _reduce_only: bool,
        ) -> Result<OrderAck> {
            self.market_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_placement {
                return Err(anyhow!("exchange unavailable"));
            }
            Ok(OrderAck {
                order_id: (!self.omit_order_id).then_some(1001),
            })
        }

        async fn place_stop_loss_market(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: f64,
            _stop_price: f64,
            _close_position: bool,
        ) -> Result<OrderAck> {
            self.protective_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_protective {
                return Err(anyhow!("SL rejected"));
            }
            Ok(OrderAck { order_id: Some(2001) })
        }

        async fn place_take_profit_market(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: f64,
            _stop_price: f64,
            _close_position: bool,
        ) -> Result<OrderAck> {
            self.protective_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_protective {
                return Err(anyhow!("TP rejected"));
            }
            Ok(OrderAck { order_id: Some(2002) })
        }

        async fn get_order(&self, _symbol: &str, order_id: u64) -> Result<OrderInfo> {
            Ok(OrderInfo {
                order_id,
                status: self.fill_status,
                avg_price: 37_000.0,
                executed_qty: 0.5,
            })
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: u64) -> Result<()> {
            Ok(())
        }

        async fn cancel_all_open_orders(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }

        async fn get_position(&self, _symbol: &str) -> Result<PositionInfo> {
            Ok(PositionInfo::default())
        }

        async fn get_balance_usdt(&self) -> Result<f64> {
            Ok(10_000.0)
        }

        async fn get_klines(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: u32,
        ) -> Result<Vec<crate::types::Kline>> {
            Ok(Vec::new())
        }

        async fn get_ticker(&self, _symbol: &str) -> Result<f64> {
            Ok(37_000.0)
        }
    }

    // ---- circuit breaker ---------------------------------------------------

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn breaker_half_open_allows_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Reset window of zero: next acquire transitions to half-open.
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // A concurrent second trial is refused.
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn breaker_failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.try_acquire()); // half-open trial
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    // ---- executor ----------------------------------------------------------

    #[tokio::test]
    async fn fills_with_protection() {
        let exchange = Arc::new(MockExchange::filled());
        let executor = OrderExecutor::new("BTCUSDT", exchange.clone());

        let result = executor
            .execute_market_order(Side::Buy, 0.5, Some(36_500.0), Some(38_000.0), false)
            .await;

        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::FilledWithProtection);
        assert_eq!(result.order_id, Some(1001));
        assert_eq!(result.sl_order_id, Some(2001));
        assert_eq!(result.tp_order_id, Some(2002));
        assert_eq!(exchange.market_calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.protective_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fills_without_protection_when_no_sl_tp_given() {
        let exchange = Arc::new(MockExchange::filled());
        let executor = OrderExecutor::new("BTCUSDT", exchange.clone());

        let result = executor
            .execute_market_order(Side::Sell, 0.5, None, None, false)
            .await;

        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Filled);
        assert_eq!(exchange.protective_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn protective_failure_degrades_but_does_not_fail_parent() {
        let exchange = Arc::new(MockExchange {
            fail_protective: true,
            ..MockExchange::filled()
        });
        let executor = OrderExecutor::new("BTCUSDT", exchange.clone());

        let result = executor
            .execute_market_order(Side::Buy, 0.5, Some(36_500.0), Some(38_000.0), false)
            .await;

        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Filled);
        assert!(result.sl_order_id.is_none());
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected_without_exchange_call() {
        let exchange = Arc::new(MockExchange::filled());
        let executor = OrderExecutor::new("BTCUSDT", exchange.clone());

        let result = executor
            .execute_market_order(Side::Buy, 0.0001, None, None, false)
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::InvalidQuantity);
        assert_eq!(exchange.market_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_order_id_is_a_failure() {
        let exchange = Arc::new(MockExchange {
            omit_order_id: true,
            ..MockExchange::filled()
        });
        let executor = OrderExecutor::new("BTCUSDT", exchange);

        let result = executor
            .execute_market_order(Side::Buy, 0.5, None, None, false)
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::NoOrderId);
    }

    #[tokio::test]
    async fn terminal_cancel_is_not_filled() {
        let exchange = Arc::new(MockExchange {
            fill_status: OrderStatus::Canceled,
            ..MockExchange::filled()
        });
        let executor = OrderExecutor::new("BTCUSDT", exchange);

        let result = executor
            .execute_market_order(Side::Buy, 0.5, None, None, false)
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::NotFilled);
        assert_eq!(result.order_id, Some(1001));
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_exchange_call() {
        let exchange = Arc::new(MockExchange {
            fail_placement: true,
            ..MockExchange::filled()
        });
        let executor = OrderExecutor::new("BTCUSDT", exchange.clone())
            .with_breaker(CircuitBreaker::new(2, Duration::from_secs(60)));

        for _ in 0..2 {
            let r = executor
                .execute_market_order(Side::Buy, 0.5, None, None, false)
                .await;
            assert_eq!(r.status, ExecutionStatus::Error);
        }
        assert_eq!(executor.breaker_state(), BreakerState::Open);

        let calls_before = exchange.market_calls.load(Ordering::SeqCst);
        let result = executor
            .execute_market_order(Side::Buy, 0.5, None, None, false)
            .await;
        assert_eq!(result.status, ExecutionStatus::CircuitBreakerOpen);
        assert_eq!(exchange.market_calls.load(Ordering::SeqCst), calls_before);
    }

    #[test]
    fn quantity_formats_down_to_precision() {
        let exchange = Arc::new(MockExchange::filled());
        let executor = OrderExecutor::new("BTCUSDT", exchange).with_qty_precision(3);
        assert!((executor.format_quantity(0.123_999) - 0.123).abs() < 1e-12);
        assert_eq!(executor.format_quantity(0.000_4), 0.0);
    }
}
