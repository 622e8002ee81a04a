// =============================================================================
// Trading Engine — event loop coupling market data, the agent graph, the
// risk governor, and order execution
// =============================================================================
//
// One closed kline => at most one analysis cycle. Cycles are serialised by
// construction (a single consumer task drains the kline channel); a backlog
// of closed klines drops oldest-first with a warning. Every cycle is
// wrapped in top-level recovery: errors are logged and the engine keeps
// running. The final decision degrades to HOLD on any internal failure and
// no order is placed.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agents::graph::{CycleState, TradingGraph};
use crate::agents::report::Signal;
use crate::config::AppConfig;
use crate::context::SentimentContextFetcher;
use crate::execution::OrderExecutor;
use crate::indicator_buffer::IndicatorBuffer;
use crate::market_data::MarketDataFeed;
use crate::reasoning::{ReasoningJudge, ReasoningStore};
use crate::risk::RiskGovernor;
use crate::types::{Kline, Side, TradeRecord, TradingMode};

/// Observer hook for dashboard/frontend events. Must never block; the
/// engine tolerates its absence.
pub type AgentEventHook = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

/// Renders a chart artifact for the visual agent. Externalized; the core
/// only requires graceful degradation to "no chart".
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn render(&self, symbol: &str, timeframe: &str) -> Result<String>;
}

/// Engine status snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub symbol: String,
    pub timeframe: String,
    pub mode: TradingMode,
    pub kline_count: u64,
    pub cycle_count: u64,
    pub consecutive_holds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_decision_time: Option<DateTime<Utc>>,
    pub current_price: f64,
}

/// The engine. Owns every collaborator explicitly; nothing global.
pub struct TradingEngine {
    config: AppConfig,

    feed: Arc<MarketDataFeed>,
    buffer: Arc<IndicatorBuffer>,
    graph: Arc<TradingGraph>,
    store: Arc<ReasoningStore>,
    governor: Arc<RiskGovernor>,
    executor: Arc<OrderExecutor>,

    context: Option<Arc<SentimentContextFetcher>>,
    chart: Option<Arc<dyn ChartSource>>,
    judge: Option<Arc<ReasoningJudge>>,
    observer: RwLock<Option<AgentEventHook>>,

    running: AtomicBool,
    closed_klines: AtomicU64,
    cycle_seq: AtomicU64,
    consecutive_holds: AtomicU64,
    last_decision_time: RwLock<Option<DateTime<Utc>>>,

    signal_log_path: PathBuf,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        feed: Arc<MarketDataFeed>,
        buffer: Arc<IndicatorBuffer>,
        graph: Arc<TradingGraph>,
        store: Arc<ReasoningStore>,
        governor: Arc<RiskGovernor>,
        executor: Arc<OrderExecutor>,
    ) -> Self {
        let signal_log_path = PathBuf::from(&config.logging.signal_log_path);
        if let Some(parent) = signal_log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        Self {
            config,
            feed,
            buffer,
            graph,
            store,
            governor,
            executor,
            context: None,
            chart: None,
            judge: None,
            observer: RwLock::new(None),
            running: AtomicBool::new(false),
            closed_klines: AtomicU64::new(0),
            cycle_seq: AtomicU64::new(0),
            consecutive_holds: AtomicU64::new(0),
            last_decision_time: RwLock::new(None),
            signal_log_path,
            loop_task: Mutex::new(None),
        }
    }

    pub fn with_context_fetcher(mut self, fetcher: Arc<SentimentContextFetcher>) -> Self {
        self.context = Some(fetcher);
        self
    }

    pub fn with_chart_source(mut self, chart: Arc<dyn ChartSource>) -> Self {
        self.chart = Some(chart);
        self
    }

    pub fn with_judge(mut self, judge: Arc<ReasoningJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Attach (or replace) the observer hook.
    pub fn set_observer(&self, hook: AgentEventHook) {
        *self.observer.write() = Some(hook);
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        if let Some(hook) = self.observer.read().as_ref() {
            (hook.as_ref())(event, payload);
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the feed and the cycle loop. Returns an error only on
    /// initialization failure; a second call is a warned no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("trading engine already running");
            return Ok(());
        }

        info!(
            symbol = %self.config.trading.symbol,
            timeframe = %self.config.trading.timeframe,
            mode = %self.config.trading.mode,
            "trading engine starting"
        );

        let mut rx = self.feed.subscribe();
        self.feed.start();

        let engine = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(kline) => engine.on_kline(kline).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "kline backlog — dropped oldest queued klines");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("kline channel closed — cycle loop ending");
                        break;
                    }
                }
            }
        });
        *self.loop_task.lock() = Some(task);

        info!("trading engine started and listening for closed klines");
        Ok(())
    }

    /// Stop the stream and cancel the cycle loop. Persisted state (signal
    /// log, reasoning store, risk state) is already flushed on write.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.feed.stop();
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
        info!("trading engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            symbol: self.config.trading.symbol.clone(),
            timeframe: self.config.trading.timeframe.clone(),
            mode: self.config.trading.mode,
            kline_count: self.closed_klines.load(Ordering::SeqCst),
            cycle_count: self.cycle_seq.load(Ordering::SeqCst),
            consecutive_holds: self.consecutive_holds.load(Ordering::SeqCst),
            last_decision_time: *self.last_decision_time.read(),
            current_price: self.feed.current_price(),
        }
    }

    // -------------------------------------------------------------------------
    // Kline handling
    // -------------------------------------------------------------------------

    /// Handle one kline delivery. In-progress klines are ignored; closed
    /// klines feed the buffer and, past warm-up, trigger one cycle.
    async fn on_kline(&self, kline: Kline) {
        if !kline.is_closed {
            return;
        }

        let accepted = self.buffer.append(
            kline.close,
            kline.high,
            kline.low,
            kline.volume,
            Some(kline.open),
            Some(kline.open_time),
        );
        if !accepted {
            warn!(open_time = kline.open_time, "rejected invalid kline — no cycle");
            return;
        }

        let count = self.closed_klines.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            close = kline.close,
            high = kline.high,
            low = kline.low,
            count,
            "closed kline"
        );

        if count < self.config.trading.min_klines_to_start {
            info!(
                have = count,
                need = self.config.trading.min_klines_to_start,
                "warming up"
            );
            return;
        }

        // Top-level recovery: a failing cycle never kills the loop.
        if let Err(e) = self.run_cycle().await {
            error!(error = %e, "analysis cycle failed — continuing");
        }
    }

    // -------------------------------------------------------------------------
    // Analysis cycle
    // -------------------------------------------------------------------------

    async fn run_cycle(&self) -> Result<()> {
        let started = Utc::now();

        // 1. Indicators; abort quietly when nothing is available.
        let indicators = self.buffer.current_indicators();
        if indicators.is_empty() {
            warn!("no indicators available — skipping cycle");
            return Ok(());
        }

        // 2. Microstructure snapshot.
        let micro = self.feed.microstructure();

        let cycle = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = CycleState::new(
            self.config.trading.symbol.clone(),
            self.config.trading.timeframe.clone(),
            cycle,
        );
        state.current_price = {
            let live = self.feed.current_price();
            if live > 0.0 {
                live
            } else {
                indicators.get("last_price").unwrap_or(0.0)
            }
        };
        state.current_volume = {
            let live = self.feed.current_volume();
            if live > 0.0 {
                live
            } else {
                indicators.get("curr_vol").unwrap_or(0.0)
            }
        };
        state.indicators = indicators;
        state.micro = micro;

        // 3. Best-effort external sentiment context.
        if self.config.agents.enable_sentiment {
            if let Some(fetcher) = &self.context {
                state.sentiment_context =
                    Some(fetcher.fetch(&self.config.trading.symbol).await);
            }
        }

        // 4. Optional chart artifact for the visual agent.
        if self.config.agents.enable_visual {
            if let Some(chart) = &self.chart {
                match chart
                    .render(&self.config.trading.symbol, &self.config.trading.timeframe)
                    .await
                {
                    Ok(b64) => state.chart_b64 = Some(b64),
                    Err(e) => warn!(error = %e, "chart rendering failed — visual agent will be skipped"),
                }
            }
        }

        // 5. Run the agent graph.
        let state = self.graph.run(state).await;

        // 6. Observer events for each produced report.
        self.emit_agent_events(&state);

        // 7. Final decision + structured signal record.
        let decision = state
            .final_trade_decision
            .clone()
            .unwrap_or_else(crate::agents::report::DecisionReport::fallback);

        info!(
            decision = %decision.final_decision,
            confidence = %decision.confidence_in_decision,
            price = state.current_price,
            "final trade decision"
        );
        self.emit(
            "final_decision",
            serde_json::json!({
                "decision": decision.final_decision.as_str(),
                "confidence": decision.confidence_in_decision.as_str(),
                "reasoning": decision.reason.clone(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        self.log_signal(&state, &decision);

        // 8/9. Execute or count the hold.
        match decision.final_decision {
            Signal::Buy => self.execute_trade(&state, Side::Buy).await,
            Signal::Sell => self.execute_trade(&state, Side::Sell).await,
            Signal::Hold => {
                let holds = self.consecutive_holds.fetch_add(1, Ordering::SeqCst) + 1;
                info!(consecutive_holds = holds, "holding");
            }
        }

        // Optional judge pass over the decision trace, best-effort.
        if self.config.agents.enable_judge {
            if let Some(judge) = &self.judge {
                if let Some(entry) = self.store.get_recent("decision", 1).into_iter().next() {
                    let _ = judge.judge_and_attach(&self.store, &entry).await;
                }
            }
        }

        debug!(
            elapsed_s = (Utc::now() - started).num_milliseconds() as f64 / 1000.0,
            cycle,
            "analysis cycle complete"
        );
        Ok(())
    }

    fn emit_agent_events(&self, state: &CycleState) {
        let mut reports: Vec<(&str, serde_json::Value, Option<String>)> = Vec::new();

        if let Some(r) = &state.technical_report {
            reports.push((
                "technical",
                serde_json::to_value(r).unwrap_or_default(),
                r.meta.reasoning_digest.clone(),
            ));
        }
        if let Some(r) = &state.qabba_report {
            reports.push((
                "qabba",
                serde_json::to_value(r).unwrap_or_default(),
                r.meta.reasoning_digest.clone(),
            ));
        }
        if let Some(r) = &state.sentiment_report {
            reports.push((
                "sentiment",
                serde_json::to_value(r).unwrap_or_default(),
                r.meta.reasoning_digest.clone(),
            ));
        }
        if let Some(r) = &state.visual_report {
            reports.push((
                "visual",
                serde_json::to_value(r).unwrap_or_default(),
                r.meta.reasoning_digest.clone(),
            ));
        }
        if let Some(r) = &state.decision_report {
            reports.push((
                "decision",
                serde_json::to_value(r).unwrap_or_default(),
                r.meta.reasoning_digest.clone(),
            ));
        }
        if let Some(r) = &state.risk_assessment {
            reports.push((
                "risk",
                serde_json::to_value(r).unwrap_or_default(),
                r.meta.reasoning_digest.clone(),
            ));
        }

        for (agent, data, digest) in reports {
            self.emit(
                "agent_output",
                serde_json::json!({
                    "agent_name": agent,
                    "data": data,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            );
            if let Some(digest) = digest {
                self.emit(
                    "reasoning:new",
                    serde_json::json!({
                        "agent_name": agent,
                        "prompt_digest": digest,
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                );
            }
        }
    }

    /// One JSON object per line: the audited signal record.
    fn log_signal(&self, state: &CycleState, decision: &crate::agents::report::DecisionReport) {
        let record = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "symbol": state.symbol,
            "timeframe": state.timeframe,
            "decision": decision.final_decision.as_str(),
            "confidence": decision.confidence_in_decision.as_str(),
            "reasoning": decision.reason.clone(),
            "price": state.current_price,
            "execution_times": state.execution_times,
        });

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.signal_log_path)
            .and_then(|mut f| writeln!(f, "{record}"));
        if let Err(e) = result {
            error!(error = %e, "failed to append signal log");
        }
    }

    // -------------------------------------------------------------------------
    // Trade execution
    // -------------------------------------------------------------------------

    async fn execute_trade(&self, state: &CycleState, side: Side) {
        self.consecutive_holds.store(0, Ordering::SeqCst);
        *self.last_decision_time.write() = Some(Utc::now());

        if self.config.trading.mode == TradingMode::Paper {
            info!(
                %side,
                price = state.current_price,
                "PAPER TRADE — no order placed"
            );
            return;
        }

        // 8a. Refresh balance and consult the risk governor.
        let Some(balance) = self.executor.get_balance().await else {
            error!("could not fetch balance — aborting trade");
            return;
        };
        self.governor.update_balance(balance);

        let base_position_size = balance * self.config.trading.base_risk_per_trade;
        let (allowed, risk_status) = self
            .governor
            .check_trade_allowed(&self.config.trading.symbol, base_position_size);
        if !allowed {
            error!(status = %risk_status.describe(), "TRADE BLOCKED BY RISK GOVERNOR");
            self.emit(
                "risk:blocked",
                serde_json::json!({
                    "status": risk_status,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            );
            return;
        }

        // 8b. Size the position through the risk bias.
        let position_size = self.governor.adjusted_size(base_position_size);

        // 8c. Quantity and notional floor.
        let entry_price = if state.current_price > 0.0 {
            state.current_price
        } else {
            warn!("no current price available — aborting trade");
            return;
        };
        let quantity = position_size / entry_price;
        if position_size < self.config.trading.min_notional {
            warn!(
                notional = position_size,
                min = self.config.trading.min_notional,
                "trade below minimum notional — skipped"
            );
            return;
        }

        // Protective levels from volatility when ATR is available.
        let (stop_loss, take_profit) = match state.indicators.get("atr") {
            Some(atr) if atr > 0.0 => match side {
                Side::Buy => (
                    Some(entry_price - 1.5 * atr),
                    Some(entry_price + 2.5 * atr),
                ),
                Side::Sell => (
                    Some(entry_price + 1.5 * atr),
                    Some(entry_price - 2.5 * atr),
                ),
            },
            _ => (None, None),
        };

        // 8d. Execute and record.
        let result = self
            .executor
            .execute_market_order(side, quantity, stop_loss, take_profit, false)
            .await;

        let trade_id = result
            .order_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| format!("failed_{}", Utc::now().timestamp_millis()));

        if result.success {
            info!(
                %side,
                qty = result.executed_qty,
                price = result.entry_price,
                status = %result.status,
                "trade executed"
            );
        } else {
            error!(status = %result.status, message = %result.message, "trade failed");
        }

        let fill_price = if result.entry_price > 0.0 {
            result.entry_price
        } else {
            entry_price
        };
        let record = TradeRecord::provisional(
            trade_id.clone(),
            self.config.trading.symbol.clone(),
            side,
            fill_price,
            result.executed_qty * fill_price,
            result.success,
        );
        self.governor.record_trade(record);

        // Outcome attribution: update the decision trace by digest.
        let digest = state
            .decision_report
            .as_ref()
            .and_then(|d| d.meta.reasoning_digest.clone());
        if let Some(digest) = digest {
            let updated = self.store.update_outcome(
                "decision",
                &digest,
                result.success,
                0.0,
                Some(trade_id),
                None,
                None,
                Some("provisional: recorded at placement".to_string()),
            );
            if !updated {
                warn!(digest = %digest, "decision trace not found for outcome attribution");
            }
        }
    }
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine")
            .field("symbol", &self.config.trading.symbol)
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::report::AgentKind;
    use crate::config::{AgentModelConfig, AgentsConfig, LlmConfig, ProviderModel};
    use crate::exchange::{ExchangeClient, OrderAck, OrderInfo, OrderStatus, PositionInfo};
    use crate::llm::{Generation, GenerationError, GenerationParams, ProviderRegistry, TextGenerator};
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    // ---- doubles -----------------------------------------------------------

    struct ScriptedLlm;

    #[async_trait]
    impl TextGenerator for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            model_id: &str,
            prompt: &str,
            _params: &GenerationParams,
        ) -> Result<Generation, GenerationError> {
            let text = if prompt.contains("Read the trend and momentum") {
                r#"{"signal": "BUY", "confidence": "HIGH", "reason": "trend up"}"#
            } else if prompt.contains("Judge the band structure") {
                r#"{"signal": "BUY_QABBA", "order_flow_bias": "buying"}"#
            } else if prompt.contains("Synthesize the reports") {
                r#"{"final_decision": "BUY", "confidence_in_decision": "HIGH", "combined_reasoning": "aligned"}"#
            } else if prompt.contains("Score the risk") {
                r#"{"verdict": "APPROVE", "risk_score": 2.0}"#
            } else {
                r#"{"overall_sentiment": "NEUTRAL", "confidence_score": 0.5}"#
            };
            Ok(Generation {
                text: text.to_string(),
                provider: "scripted".to_string(),
                model: model_id.to_string(),
                latency_ms: 1.0,
            })
        }
    }

    struct CountingExchange {
        market_calls: AtomicU32,
        balance: f64,
    }

    impl CountingExchange {
        fn new(balance: f64) -> Self {
            Self {
                market_calls: AtomicU32::new(0),
                balance,
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for CountingExchange {
        async fn place_market_order(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: f64,
            _reduce_only: bool,
        ) -> Result<OrderAck> {
            self.market_calls.fetch_add(1, Ordering::SeqCst);
            Ok(OrderAck {
                order_id: Some(1001),
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
            Ok(OrderAck {
                order_id: Some(2001),
            })
        }

        async fn place_take_profit_market(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: f64,
            _stop_price: f64,
            _close_position: bool,
        ) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: Some(2002),
            })
        }

        async fn get_order(&self, _symbol: &str, order_id: u64) -> Result<OrderInfo> {
            Ok(OrderInfo {
                order_id,
                status: OrderStatus::Filled,
                avg_price: 37_000.0,
                executed_qty: 0.1,
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
            Ok(self.balance)
        }

        async fn get_klines(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: u32,
        ) -> Result<Vec<Kline>> {
            Ok(Vec::new())
        }

        async fn get_ticker(&self, _symbol: &str) -> Result<f64> {
            Ok(37_000.0)
        }
    }

    struct Harness {
        engine: Arc<TradingEngine>,
        exchange: Arc<CountingExchange>,
        store: Arc<ReasoningStore>,
        governor: Arc<RiskGovernor>,
        events: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        _dir: TempDir,
    }

    fn harness(mode: TradingMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();

        let mut config = AppConfig::default();
        config.trading.mode = mode;
        config.trading.symbol = "BTCUSDT".to_string();
        config.logging.signal_log_path = dir
            .path()
            .join("signals.jsonl")
            .to_string_lossy()
            .to_string();
        config.agents = AgentsConfig {
            enable_sentiment: false,
            enable_visual: false,
            enable_judge: false,
        };

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(ScriptedLlm));

        let mut llm = LlmConfig::default();
        for kind in [
            AgentKind::Technical,
            AgentKind::Qabba,
            AgentKind::Sentiment,
            AgentKind::Visual,
            AgentKind::Decision,
            AgentKind::Risk,
        ] {
            llm.agents.insert(
                kind.name().to_string(),
                AgentModelConfig {
                    providers: vec![ProviderModel {
                        provider: "scripted".to_string(),
                        model: "test".to_string(),
                    }],
                    ..AgentModelConfig::default()
                },
            );
        }
        config.llm = llm.clone();

        let store = Arc::new(ReasoningStore::open(dir.path().join("reasoning")).unwrap());
        let graph = Arc::new(TradingGraph::new(
            registry,
            store.clone(),
            llm,
            config.agents.clone(),
        ));

        let governor = Arc::new(RiskGovernor::new(
            config.risk_management.clone(),
            dir.path().join("risk.jsonl"),
        ));
        let exchange = Arc::new(CountingExchange::new(10_000.0));
        let executor = Arc::new(OrderExecutor::new("BTCUSDT", exchange.clone()));

        let feed = Arc::new(MarketDataFeed::new("BTCUSDT", "15m"));
        let buffer = Arc::new(IndicatorBuffer::new());

        let engine = Arc::new(TradingEngine::new(
            config,
            feed,
            buffer,
            graph,
            store.clone(),
            governor.clone(),
            executor,
        ));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.set_observer(Arc::new(move |event: &str, payload: serde_json::Value| {
            sink.lock().push((event.to_string(), payload));
        }));

        Harness {
            engine,
            exchange,
            store,
            governor,
            events,
            _dir: dir,
        }
    }

    fn kline(i: u64, close: f64) -> Kline {
        Kline {
            open_time: i as i64 * 900_000,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            is_closed: true,
        }
    }

    fn loss(pnl: f64) -> TradeRecord {
        TradeRecord {
            trade_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            symbol: "BTCUSDT".to_string(),
            decision: Side::Sell,
            entry_price: 37_000.0,
            exit_price: None,
            pnl,
            pnl_pct: 0.0,
            success: false,
            size: 100.0,
        }
    }

    // ---- scenarios ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn warm_up_gates_first_cycle_at_twenty_klines() {
        let h = harness(TradingMode::Paper);

        for i in 0..19 {
            h.engine.on_kline(kline(i, 100.0 + i as f64)).await;
        }
        assert_eq!(h.engine.status().cycle_count, 0, "no cycle during warm-up");

        h.engine.on_kline(kline(19, 119.0)).await;
        assert_eq!(h.engine.status().cycle_count, 1, "20th kline triggers one cycle");
        assert_eq!(h.engine.status().kline_count, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn in_progress_klines_are_ignored() {
        let h = harness(TradingMode::Paper);
        let mut k = kline(0, 100.0);
        k.is_closed = false;
        h.engine.on_kline(k).await;
        assert_eq!(h.engine.status().kline_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paper_mode_never_touches_the_exchange() {
        let h = harness(TradingMode::Paper);
        for i in 0..25 {
            h.engine.on_kline(kline(i, 100.0 + i as f64)).await;
        }
        assert!(h.engine.status().cycle_count > 0);
        assert_eq!(h.exchange.market_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn severe_mode_blocks_execution_with_no_exchange_call() {
        let h = harness(TradingMode::Live);

        // Force SEVERE: five losses of 300 on a 10k balance.
        h.governor.update_balance(10_000.0);
        for _ in 0..5 {
            h.governor.record_trade(loss(-300.0));
        }

        for i in 0..20 {
            h.engine.on_kline(kline(i, 100.0 + i as f64)).await;
        }
        assert_eq!(h.engine.status().cycle_count, 1);

        // The BUY decision was made, but no order reached the exchange.
        assert_eq!(h.exchange.market_calls.load(Ordering::SeqCst), 0);
        let events = h.events.lock();
        assert!(
            events.iter().any(|(name, _)| name == "risk:blocked"),
            "risk:blocked event expected"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn live_buy_executes_records_and_attributes_outcome() {
        let h = harness(TradingMode::Live);

        for i in 0..20 {
            h.engine.on_kline(kline(i, 100.0 + i as f64)).await;
        }

        // Order reached the exchange exactly once.
        assert_eq!(h.exchange.market_calls.load(Ordering::SeqCst), 1);

        // The decision trace was updated with the order id in-cycle.
        let stats = h.store.get_success_rate("decision", 100);
        assert_eq!(stats.total_evaluated, 1);
        assert_eq!(stats.successful, 1);

        let entry = h.store.get_recent("decision", 1).remove(0);
        let outcome = entry.outcome.unwrap();
        assert_eq!(outcome.trade_id.as_deref(), Some("1001"));

        // The governor saw the provisional record.
        let status = h.governor.summary();
        assert_eq!(status.metrics.total_trades, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_log_records_every_cycle() {
        let h = harness(TradingMode::Paper);
        for i in 0..22 {
            h.engine.on_kline(kline(i, 100.0 + i as f64)).await;
        }

        let content = std::fs::read_to_string(&h.engine.signal_log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len() as u64, h.engine.status().cycle_count);

        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        for key in ["timestamp", "symbol", "timeframe", "decision", "confidence", "price", "execution_times"] {
            assert!(record.get(key).is_some(), "missing signal key {key}");
        }
        assert_eq!(record["symbol"], "BTCUSDT");
    }

    #[tokio::test(start_paused = true)]
    async fn observer_receives_agent_and_final_events() {
        let h = harness(TradingMode::Paper);
        for i in 0..20 {
            h.engine.on_kline(kline(i, 100.0 + i as f64)).await;
        }

        let events = h.events.lock();
        assert!(events.iter().any(|(name, _)| name == "agent_output"));
        assert!(events.iter().any(|(name, _)| name == "reasoning:new"));
        assert!(events.iter().any(|(name, _)| name == "final_decision"));
    }

    #[tokio::test(start_paused = true)]
    async fn engine_without_observer_still_cycles() {
        let h = harness(TradingMode::Paper);
        *h.engine.observer.write() = None;
        for i in 0..20 {
            h.engine.on_kline(kline(i, 100.0 + i as f64)).await;
        }
        assert_eq!(h.engine.status().cycle_count, 1);
    }

    #[tokio::test]
    async fn stop_then_start_preserves_reasoning_and_risk_state() {
        let h = harness(TradingMode::Paper);

        h.engine.start().unwrap();
        assert!(h.engine.is_running());

        // Seed some durable state.
        let _ = h
            .store
            .store(
                "decision",
                "persistent prompt",
                &serde_json::json!({ "action": "HOLD" }),
                "raw",
                "test",
                None,
                None,
            )
            .unwrap();
        h.governor.update_balance(10_000.0);

        h.engine.stop();
        assert!(!h.engine.is_running());

        h.engine.start().unwrap();
        assert!(h.engine.is_running());
        assert_eq!(h.store.get_recent("decision", 10).len(), 1);
        h.engine.stop();
    }
}
