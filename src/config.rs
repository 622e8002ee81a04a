// =============================================================================
// Application Configuration — typed sections with serde defaults
// =============================================================================
//
// Central configuration hub for the Kestrel engine. Every tunable parameter
// lives here. Persistence uses an atomic tmp + rename pattern to prevent
// corruption on crash. All fields carry serde defaults so that adding new
// fields never breaks loading an older config file.
//
// Secrets (exchange keys, provider tokens) are NEVER stored in the file;
// they come from the environment. When the exchange credentials are absent
// the engine refuses live mode and falls back to paper.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_timeframe() -> String {
    "15m".to_string()
}

fn default_min_klines_to_start() -> u64 {
    20
}

fn default_base_risk_per_trade() -> f64 {
    0.01
}

fn default_min_notional() -> f64 {
    5.0
}

fn default_profile() -> String {
    "moderate".to_string()
}

fn default_lookback_trades() -> usize {
    12
}

fn default_severe_drawdown_pct() -> f64 {
    6.5
}

fn default_caution_drawdown_pct() -> f64 {
    4.0
}

fn default_severe_daily_loss_pct() -> f64 {
    3.5
}

fn default_caution_daily_loss_pct() -> f64 {
    2.0
}

fn default_loss_streak_halt() -> usize {
    5
}

fn default_loss_streak_caution() -> usize {
    3
}

fn default_hot_streak_win_rate() -> f64 {
    0.68
}

fn default_hot_streak_min_trades() -> usize {
    6
}

fn default_hot_streak_min_avg_pnl() -> f64 {
    12.0
}

fn default_drawdown_risk_bias() -> f64 {
    0.45
}

fn default_cooldown_risk_bias() -> f64 {
    0.70
}

fn default_hot_streak_risk_bias() -> f64 {
    1.12
}

fn default_severe_cooldown_seconds() -> i64 {
    900
}

fn default_caution_cooldown_seconds() -> i64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f64 {
    0.2
}

fn default_signal_log_path() -> String {
    "logs/signals.jsonl".to_string()
}

fn default_risk_state_path() -> String {
    "logs/risk_governor.jsonl".to_string()
}

fn default_reasoning_dir() -> String {
    "logs/reasoning".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_alert_level() -> String {
    "CAUTION".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// Trading section
// =============================================================================

/// Core trading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Instrument the engine trades, e.g. "BTCUSDT".
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Kline interval driving the analysis cycle, e.g. "15m".
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Paper (simulated) or Live execution.
    #[serde(default)]
    pub mode: TradingMode,

    /// Closed klines required before the first analysis cycle.
    #[serde(default = "default_min_klines_to_start")]
    pub min_klines_to_start: u64,

    /// Base position size as a fraction of balance (0.01 = 1 %).
    #[serde(default = "default_base_risk_per_trade")]
    pub base_risk_per_trade: f64,

    /// Minimum order notional accepted by the exchange (USDT).
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,

    /// REST API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: default_timeframe(),
            mode: TradingMode::Paper,
            min_klines_to_start: default_min_klines_to_start(),
            base_risk_per_trade: default_base_risk_per_trade(),
            min_notional: default_min_notional(),
            bind_addr: default_bind_addr(),
        }
    }
}

// =============================================================================
// Risk management section
// =============================================================================

/// Effective risk-governor thresholds after applying the selected profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskManagementConfig {
    /// Logical profile applied: conservative, moderate, or aggressive.
    #[serde(default = "default_profile")]
    pub profile: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of recent trades in the evaluation window.
    #[serde(default = "default_lookback_trades")]
    pub lookback_trades: usize,

    #[serde(default = "default_severe_drawdown_pct")]
    pub severe_drawdown_pct: f64,

    #[serde(default = "default_caution_drawdown_pct")]
    pub caution_drawdown_pct: f64,

    #[serde(default = "default_severe_daily_loss_pct")]
    pub severe_daily_loss_pct: f64,

    #[serde(default = "default_caution_daily_loss_pct")]
    pub caution_daily_loss_pct: f64,

    #[serde(default = "default_loss_streak_halt")]
    pub loss_streak_halt: usize,

    #[serde(default = "default_loss_streak_caution")]
    pub loss_streak_caution: usize,

    #[serde(default = "default_hot_streak_win_rate")]
    pub hot_streak_win_rate: f64,

    #[serde(default = "default_hot_streak_min_trades")]
    pub hot_streak_min_trades: usize,

    #[serde(default = "default_hot_streak_min_avg_pnl")]
    pub hot_streak_min_avg_pnl: f64,

    /// Size multiplier applied in SEVERE mode.
    #[serde(default = "default_drawdown_risk_bias")]
    pub drawdown_risk_bias: f64,

    /// Size multiplier applied in CAUTION mode.
    #[serde(default = "default_cooldown_risk_bias")]
    pub cooldown_risk_bias: f64,

    /// Size multiplier applied in HOT mode.
    #[serde(default = "default_hot_streak_risk_bias")]
    pub hot_streak_risk_bias: f64,

    #[serde(default = "default_severe_cooldown_seconds")]
    pub severe_cooldown_seconds: i64,

    #[serde(default = "default_caution_cooldown_seconds")]
    pub caution_cooldown_seconds: i64,
}

impl Default for RiskManagementConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            enabled: true,
            lookback_trades: default_lookback_trades(),
            severe_drawdown_pct: default_severe_drawdown_pct(),
            caution_drawdown_pct: default_caution_drawdown_pct(),
            severe_daily_loss_pct: default_severe_daily_loss_pct(),
            caution_daily_loss_pct: default_caution_daily_loss_pct(),
            loss_streak_halt: default_loss_streak_halt(),
            loss_streak_caution: default_loss_streak_caution(),
            hot_streak_win_rate: default_hot_streak_win_rate(),
            hot_streak_min_trades: default_hot_streak_min_trades(),
            hot_streak_min_avg_pnl: default_hot_streak_min_avg_pnl(),
            drawdown_risk_bias: default_drawdown_risk_bias(),
            cooldown_risk_bias: default_cooldown_risk_bias(),
            hot_streak_risk_bias: default_hot_streak_risk_bias(),
            severe_cooldown_seconds: default_severe_cooldown_seconds(),
            caution_cooldown_seconds: default_caution_cooldown_seconds(),
        }
    }
}

impl RiskManagementConfig {
    /// Apply a named profile's threshold overrides on top of the defaults.
    ///
    /// Unknown profile names keep the moderate defaults with a warning.
    pub fn with_profile(profile: &str) -> Self {
        let mut cfg = Self {
            profile: profile.to_string(),
            ..Self::default()
        };

        match profile {
            "conservative" => {
                cfg.severe_drawdown_pct = 5.0;
                cfg.caution_drawdown_pct = 3.0;
                cfg.severe_daily_loss_pct = 2.5;
                cfg.caution_daily_loss_pct = 1.5;
                cfg.loss_streak_halt = 4;
                cfg.hot_streak_risk_bias = 1.05;
            }
            "moderate" => {}
            "aggressive" => {
                cfg.severe_drawdown_pct = 8.0;
                cfg.caution_drawdown_pct = 5.5;
                cfg.severe_daily_loss_pct = 5.0;
                cfg.caution_daily_loss_pct = 3.0;
                cfg.loss_streak_halt = 6;
                cfg.loss_streak_caution = 4;
                cfg.hot_streak_risk_bias = 1.20;
            }
            other => {
                warn!(profile = %other, "unknown risk profile — keeping moderate defaults");
                cfg.profile = default_profile();
            }
        }

        cfg
    }
}

// =============================================================================
// LLM section
// =============================================================================

/// One (provider, model) pair in an agent's fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModel {
    /// Registered provider name, e.g. "openai" or "ollama".
    pub provider: String,
    /// Model identifier understood by that provider.
    pub model: String,
}

/// Generation settings for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentModelConfig {
    /// Ordered fallback chain; rate-limit and model-invalid errors advance
    /// to the next entry.
    #[serde(default)]
    pub providers: Vec<ProviderModel>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for AgentModelConfig {
    fn default() -> Self {
        Self {
            providers: vec![ProviderModel {
                provider: "ollama".to_string(),
                model: "qwen2.5:7b".to_string(),
            }],
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// LLM layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Per-agent generation settings keyed by agent name (technical, qabba,
    /// sentiment, visual, decision, risk, judge). Missing agents use the
    /// default chain.
    #[serde(default)]
    pub agents: HashMap<String, AgentModelConfig>,

    /// Maximum validation retries per agent invocation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// OpenAI-compatible endpoint base URL (token from env).
    #[serde(default)]
    pub openai_base_url: Option<String>,

    /// Ollama endpoint base URL.
    #[serde(default)]
    pub ollama_base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            agents: HashMap::new(),
            max_retries: default_max_retries(),
            openai_base_url: None,
            ollama_base_url: None,
        }
    }
}

impl LlmConfig {
    /// Generation settings for `agent`, falling back to the default chain.
    pub fn for_agent(&self, agent: &str) -> AgentModelConfig {
        self.agents
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }
}

// =============================================================================
// Logging section
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_signal_log_path")]
    pub signal_log_path: String,

    #[serde(default = "default_risk_state_path")]
    pub risk_state_path: String,

    #[serde(default = "default_reasoning_dir")]
    pub reasoning_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            signal_log_path: default_signal_log_path(),
            risk_state_path: default_risk_state_path(),
            reasoning_dir: default_reasoning_dir(),
        }
    }
}

// =============================================================================
// Agents section
// =============================================================================

/// Which optional agents participate in the analysis graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_true")]
    pub enable_sentiment: bool,

    #[serde(default = "default_true")]
    pub enable_visual: bool,

    /// Run the reasoning judge over decision entries after each cycle.
    #[serde(default)]
    pub enable_judge: bool,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            enable_sentiment: true,
            enable_visual: true,
            enable_judge: false,
        }
    }
}

// =============================================================================
// Alerts section
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Alerts below this level are dropped: NORMAL < HOT < CAUTION < SEVERE.
    #[serde(default = "default_min_alert_level")]
    pub min_alert_level: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_alert_level: default_min_alert_level(),
        }
    }
}

// =============================================================================
// Secrets (environment only)
// =============================================================================

/// Secrets resolved from the environment at startup. Never serialized.
#[derive(Clone, Default)]
pub struct Credentials {
    pub exchange_api_key: Option<String>,
    pub exchange_api_secret: Option<String>,
    pub openai_token: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub discord_webhook_url: Option<String>,
}

impl Credentials {
    /// Read all secrets from the environment. Empty values count as absent.
    pub fn from_env() -> Self {
        fn get(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        Self {
            exchange_api_key: get("KESTREL_API_KEY"),
            exchange_api_secret: get("KESTREL_API_SECRET"),
            openai_token: get("KESTREL_OPENAI_TOKEN"),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: get("TELEGRAM_CHAT_ID"),
            discord_webhook_url: get("DISCORD_WEBHOOK_URL"),
        }
    }

    /// Whether live trading is possible at all.
    pub fn has_exchange_keys(&self) -> bool {
        self.exchange_api_key.is_some() && self.exchange_api_secret.is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("exchange_api_key", &self.exchange_api_key.as_deref().map(|_| "<redacted>"))
            .field("exchange_api_secret", &self.exchange_api_secret.as_deref().map(|_| "<redacted>"))
            .field("openai_token", &self.openai_token.as_deref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration for the Kestrel engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub trading: TradingConfig,

    #[serde(default)]
    pub risk_management: RiskManagementConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        // Re-derive thresholds when only a profile name was given (all other
        // fields at their defaults).
        let profile = config.risk_management.profile.clone();
        let only_profile_set = config.risk_management
            == RiskManagementConfig {
                profile: profile.clone(),
                ..RiskManagementConfig::default()
            };
        if only_profile_set && profile != default_profile() {
            config.risk_management = RiskManagementConfig::with_profile(&profile);
        }

        info!(
            path = %path.display(),
            symbol = %config.trading.symbol,
            timeframe = %config.trading.timeframe,
            mode = %config.trading.mode,
            risk_profile = %config.risk_management.profile,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Enforce the live-trading safety rule: without exchange credentials
    /// the engine must run in paper mode.
    pub fn enforce_paper_without_credentials(&mut self, creds: &Credentials) {
        if self.trading.mode == TradingMode::Live && !creds.has_exchange_keys() {
            warn!("exchange credentials missing — refusing live mode, falling back to paper");
            self.trading.mode = TradingMode::Paper;
        }
    }
}
