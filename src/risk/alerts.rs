// =============================================================================
// Alert Notifier — out-of-band notifications on risk-mode transitions
// =============================================================================
//
// A dedicated worker drains a bounded queue of risk statuses and fans them
// out to the configured channels (Telegram bot API, Discord webhook). Each
// channel has a >= 5 minute cooldown to prevent alert storms; statuses
// below the configured minimum level are dropped.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::governor::{RiskMode, RiskStatus};

/// Minimum spacing between alerts on one channel.
const CHANNEL_COOLDOWN: Duration = Duration::from_secs(300);

/// One delivery target for risk alerts.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, status: &RiskStatus) -> Result<()>;
}

// =============================================================================
// Telegram
// =============================================================================

/// Telegram bot API channel.
pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

/// Message body shared by the Telegram channel and its tests.
fn alert_text(status: &RiskStatus) -> String {
    format!(
        "RISK ALERT: {}\nReason: {}\nRisk bias: {:.2}\n\
         Win rate: {:.1}%  Daily PnL: {:.2}\nDrawdown: {:.1}%  Loss streak: {}\n{}\n{} UTC",
        status.mode,
        status.reason,
        status.risk_bias,
        status.metrics.win_rate * 100.0,
        status.metrics.daily_pnl,
        status.metrics.drawdown_pct,
        status.metrics.loss_streak,
        if status.block_trading {
            "TRADING BLOCKED"
        } else {
            "trading reduced"
        },
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
    )
}

#[async_trait]
impl AlertChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, status: &RiskStatus) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": alert_text(status),
            "disable_notification": status.mode != RiskMode::Severe,
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("telegram sendMessage request failed")?;

        let code = resp.status();
        if !code.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram API returned {code}: {body}");
        }

        info!("telegram alert sent");
        Ok(())
    }
}

impl std::fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

// =============================================================================
// Discord
// =============================================================================

/// Discord webhook channel.
pub struct DiscordChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

/// Embed color per mode.
fn discord_color(mode: RiskMode) -> u32 {
    match mode {
        RiskMode::Normal => 0x00_ff_00,
        RiskMode::Hot => 0xff_a5_00,
        RiskMode::Caution => 0xff_ff_00,
        RiskMode::Severe => 0xff_00_00,
    }
}

#[async_trait]
impl AlertChannel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, status: &RiskStatus) -> Result<()> {
        let embed = serde_json::json!({
            "title": format!("Risk governor: {}", status.mode),
            "color": discord_color(status.mode),
            "description": status.reason,
            "fields": [
                { "name": "Risk bias", "value": format!("{:.2}", status.risk_bias), "inline": true },
                { "name": "Win rate", "value": format!("{:.1}%", status.metrics.win_rate * 100.0), "inline": true },
                { "name": "Daily PnL", "value": format!("{:.2}", status.metrics.daily_pnl), "inline": true },
                { "name": "Drawdown", "value": format!("{:.1}%", status.metrics.drawdown_pct), "inline": true },
                { "name": "Loss streak", "value": status.metrics.loss_streak.to_string(), "inline": true },
                {
                    "name": "Status",
                    "value": if status.block_trading { "TRADING BLOCKED" } else { "trading reduced" },
                    "inline": false
                },
            ],
            "timestamp": Utc::now().to_rfc3339(),
        });

        let payload = serde_json::json!({ "embeds": [embed] });

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("discord webhook request failed")?;

        let code = resp.status();
        if !code.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("discord webhook returned {code}: {body}");
        }

        info!("discord alert sent");
        Ok(())
    }
}

impl std::fmt::Debug for DiscordChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordChannel")
            .field("webhook_url", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Notifier worker
// =============================================================================

/// Tracks the last delivery per channel to enforce the cooldown.
struct ChannelCooldowns {
    last_sent: HashMap<String, Instant>,
    cooldown: Duration,
}

impl ChannelCooldowns {
    fn new(cooldown: Duration) -> Self {
        Self {
            last_sent: HashMap::new(),
            cooldown,
        }
    }

    /// Whether `channel` may deliver now; marks it as delivered if so.
    fn try_acquire(&mut self, channel: &str) -> bool {
        let now = Instant::now();
        let ready = self
            .last_sent
            .get(channel)
            .map_or(true, |t| now.duration_since(*t) >= self.cooldown);
        if ready {
            self.last_sent.insert(channel.to_string(), now);
        }
        ready
    }
}

/// Drains the alert queue and fans out to the configured channels.
pub struct AlertNotifier {
    channels: Vec<Box<dyn AlertChannel>>,
    min_severity: u8,
}

impl AlertNotifier {
    /// `min_alert_level` is a mode name (NORMAL, HOT, CAUTION, SEVERE);
    /// statuses below it are dropped.
    pub fn new(channels: Vec<Box<dyn AlertChannel>>, min_alert_level: &str) -> Self {
        let min_severity = RiskMode::from_name(min_alert_level)
            .map(RiskMode::severity)
            .unwrap_or_else(|| {
                warn!(level = %min_alert_level, "unknown alert level — defaulting to CAUTION");
                RiskMode::Caution.severity()
            });

        Self {
            channels,
            min_severity,
        }
    }

    /// Spawn the dedicated worker draining `rx`. The worker lives until the
    /// queue's senders are dropped.
    pub fn spawn(self, mut rx: mpsc::Receiver<RiskStatus>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut cooldowns = ChannelCooldowns::new(CHANNEL_COOLDOWN);
            info!(channels = self.channels.len(), "alert notifier running");

            while let Some(status) = rx.recv().await {
                if status.mode.severity() < self.min_severity {
                    debug!(mode = %status.mode, "alert below minimum level — dropped");
                    continue;
                }

                for channel in &self.channels {
                    if !cooldowns.try_acquire(channel.name()) {
                        debug!(channel = channel.name(), "alert suppressed by channel cooldown");
                        continue;
                    }
                    if let Err(e) = channel.send(&status).await {
                        error!(channel = channel.name(), error = %e, "alert delivery failed");
                    }
                }
            }

            info!("alert notifier stopped");
        })
    }
}
