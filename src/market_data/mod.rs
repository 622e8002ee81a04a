// =============================================================================
// Market Data Feed — WebSocket streams for klines, depth, and trades
// =============================================================================
//
// One feed per instrument. Three stream tasks (kline, depth, aggTrade) run
// reconnect loops and feed shared state; closed klines fan out to engine
// subscribers on a bounded broadcast channel. If a subscriber falls behind,
// the oldest queued klines are dropped (the receiver observes a Lagged
// error) — in-progress klines never enter the channel at all.
// =============================================================================

pub mod kline_stream;
pub mod orderbook;
pub mod trade_stream;

pub use orderbook::OrderBookManager;
pub use trade_stream::TradeStreamProcessor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::types::Kline;

/// Capacity of the closed-kline broadcast channel.
const KLINE_CHANNEL_CAPACITY: usize = 64;

/// Seconds to wait before reconnecting a dropped stream.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Snapshot of order-flow microstructure at the start of a cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MicrostructureMetrics {
    /// Order-book imbalance in [-1, +1] (bid depth vs ask depth).
    pub obi: f64,
    /// Cumulative volume delta (signed taker volume).
    pub cvd: f64,
    /// Bid/ask spread in basis points of the mid price.
    pub spread: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
}

/// Last observed price/volume from the kline stream (covers the gap until
/// the first trade arrives).
#[derive(Default)]
pub struct QuoteState {
    pub last_price: RwLock<f64>,
    pub last_volume: RwLock<f64>,
}

/// Market data feed for a single (symbol, interval).
pub struct MarketDataFeed {
    symbol: String,
    interval: String,
    trades: Arc<TradeStreamProcessor>,
    books: Arc<OrderBookManager>,
    quote: Arc<QuoteState>,
    kline_tx: broadcast::Sender<Kline>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MarketDataFeed {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        let symbol = symbol.into();
        let (kline_tx, _) = broadcast::channel(KLINE_CHANNEL_CAPACITY);

        Self {
            trades: Arc::new(TradeStreamProcessor::new(symbol.clone())),
            books: Arc::new(OrderBookManager::new()),
            quote: Arc::new(QuoteState::default()),
            symbol,
            interval: interval.into(),
            kline_tx,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Subscribe to closed klines. May be called before or after `start`.
    pub fn subscribe(&self) -> broadcast::Receiver<Kline> {
        self.kline_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Launch the stream tasks. Idempotent: a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(symbol = %self.symbol, "market data feed already running");
            return;
        }

        let mut tasks = self.tasks.lock();

        // Kline stream
        {
            let feed = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if let Err(e) = kline_stream::run_kline_stream(
                        &feed.symbol,
                        &feed.interval,
                        &feed.kline_tx,
                        &feed.quote,
                    )
                    .await
                    {
                        error!(symbol = %feed.symbol, error = %e, "kline stream error — reconnecting");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                }
            }));
        }

        // Depth stream
        {
            let feed = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        orderbook::run_depth_stream(&feed.symbol, &feed.books).await
                    {
                        error!(symbol = %feed.symbol, error = %e, "depth stream error — reconnecting");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                }
            }));
        }

        // Trade stream
        {
            let feed = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        trade_stream::run_trade_stream(&feed.symbol, &feed.trades).await
                    {
                        error!(symbol = %feed.symbol, error = %e, "trade stream error — reconnecting");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                }
            }));
        }

        info!(symbol = %self.symbol, interval = %self.interval, "market data feed started");
    }

    /// Stop the stream tasks. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(symbol = %self.symbol, "market data feed stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Snapshot accessors
    // -------------------------------------------------------------------------

    /// Last traded price, falling back to the latest kline close before any
    /// trade has been observed.
    pub fn current_price(&self) -> f64 {
        let trade_price = self.trades.last_price();
        if trade_price > 0.0 {
            trade_price
        } else {
            *self.quote.last_price.read()
        }
    }

    pub fn current_volume(&self) -> f64 {
        *self.quote.last_volume.read()
    }

    /// Consistent microstructure snapshot for the start of a cycle.
    pub fn microstructure(&self) -> MicrostructureMetrics {
        let book = self.books.get(&self.symbol);
        MicrostructureMetrics {
            obi: book.as_ref().map_or(0.0, |b| b.imbalance),
            cvd: self.trades.cvd(),
            spread: book.as_ref().and_then(|b| b.spread_bps).unwrap_or(0.0),
            bid_depth: book.as_ref().map_or(0.0, |b| b.bid_depth),
            ask_depth: book.as_ref().map_or(0.0, |b| b.ask_depth),
        }
    }
}

impl std::fmt::Debug for MarketDataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataFeed")
            .field("symbol", &self.symbol)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}
