// =============================================================================
// Kestrel — Main Entry Point
// =============================================================================
//
// The engine refuses live trading without exchange credentials in the
// environment: missing keys force paper mode at startup.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agents;
mod api;
mod config;
mod context;
mod engine;
mod exchange;
mod execution;
mod indicator_buffer;
mod indicators;
mod llm;
mod market_data;
mod reasoning;
mod risk;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agents::graph::TradingGraph;
use crate::api::ApiState;
use crate::config::{AppConfig, Credentials, ProviderModel};
use crate::context::SentimentContextFetcher;
use crate::engine::TradingEngine;
use crate::exchange::BinanceFuturesClient;
use crate::execution::OrderExecutor;
use crate::indicator_buffer::IndicatorBuffer;
use crate::llm::providers::{OllamaProvider, OpenAiCompatProvider};
use crate::llm::ProviderRegistry;
use crate::market_data::MarketDataFeed;
use crate::reasoning::{ReasoningJudge, ReasoningStore};
use crate::risk::{AlertChannel, AlertNotifier, DiscordChannel, RiskGovernor, TelegramChannel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let mut config = AppConfig::load("kestrel.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("Kestrel trading engine starting up");

    let credentials = Credentials::from_env();
    config.enforce_paper_without_credentials(&credentials);

    info!(
        symbol = %config.trading.symbol,
        timeframe = %config.trading.timeframe,
        mode = %config.trading.mode,
        risk_profile = %config.risk_management.profile,
        "configuration resolved"
    );

    // ── 2. Text-generation providers ─────────────────────────────────────
    let registry = Arc::new(ProviderRegistry::new());

    let ollama_url = config
        .llm
        .ollama_base_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
    registry.register(Arc::new(OllamaProvider::new(ollama_url)));

    if let Some(base_url) = config.llm.openai_base_url.clone() {
        registry.register(Arc::new(OpenAiCompatProvider::new(
            "openai",
            base_url,
            credentials.openai_token.clone(),
            registry.limiter(),
        )));
    }
    info!(providers = ?registry.available(), "text-generation providers registered");

    // ── 3. Reasoning store ───────────────────────────────────────────────
    let store = Arc::new(ReasoningStore::open(&config.logging.reasoning_dir)?);

    // ── 4. Risk governor + alert notifier ────────────────────────────────
    let (alert_tx, alert_rx) = tokio::sync::mpsc::channel(32);
    let governor = Arc::new(
        RiskGovernor::new(
            config.risk_management.clone(),
            &config.logging.risk_state_path,
        )
        .with_alert_channel(alert_tx),
    );

    let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
    if let (Some(token), Some(chat_id)) = (
        credentials.telegram_bot_token.clone(),
        credentials.telegram_chat_id.clone(),
    ) {
        channels.push(Box::new(TelegramChannel::new(token, chat_id)));
    }
    if let Some(url) = credentials.discord_webhook_url.clone() {
        channels.push(Box::new(DiscordChannel::new(url)));
    }
    if config.alerts.enabled && !channels.is_empty() {
        info!(channels = channels.len(), "alert notifier enabled");
        AlertNotifier::new(channels, &config.alerts.min_alert_level).spawn(alert_rx);
    } else {
        info!("alert notifier disabled (no channels configured)");
        // Drain the queue so the governor's sends never back up.
        tokio::spawn(async move {
            let mut rx = alert_rx;
            while rx.recv().await.is_some() {}
        });
    }

    // ── 5. Exchange client + executor ────────────────────────────────────
    let exchange = Arc::new(BinanceFuturesClient::new(
        credentials.exchange_api_key.clone().unwrap_or_default(),
        credentials.exchange_api_secret.clone().unwrap_or_default(),
    ));
    let executor = Arc::new(OrderExecutor::new(
        config.trading.symbol.clone(),
        exchange.clone(),
    ));

    // ── 6. Market data + indicator buffer ────────────────────────────────
    let feed = Arc::new(MarketDataFeed::new(
        config.trading.symbol.clone(),
        config.trading.timeframe.clone(),
    ));
    let buffer = Arc::new(IndicatorBuffer::new());

    // ── 7. Agent graph + engine ──────────────────────────────────────────
    let graph = Arc::new(TradingGraph::new(
        registry.clone(),
        store.clone(),
        config.llm.clone(),
        config.agents.clone(),
    ));

    let mut engine = TradingEngine::new(
        config.clone(),
        feed,
        buffer,
        graph,
        store.clone(),
        governor.clone(),
        executor,
    )
    .with_context_fetcher(Arc::new(SentimentContextFetcher::new()));

    if config.agents.enable_judge {
        let judge_chain: Vec<ProviderModel> = config.llm.for_agent("judge").providers;
        engine = engine.with_judge(Arc::new(ReasoningJudge::new(registry.clone(), judge_chain)));
    }

    let engine = Arc::new(engine);

    // ── 8. REST API server ───────────────────────────────────────────────
    let api_state = ApiState {
        engine: engine.clone(),
        governor: governor.clone(),
        store: store.clone(),
    };
    let bind_addr = config.trading.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    // ── 9. Run until shutdown ────────────────────────────────────────────
    engine.start()?;
    info!("all subsystems running — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    engine.stop();
    info!("Kestrel shut down complete");
    Ok(())
}
