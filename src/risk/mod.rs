// =============================================================================
// Risk — runtime risk governor and out-of-band alerting
// =============================================================================

pub mod alerts;
pub mod governor;

pub use alerts::{AlertChannel, AlertNotifier, DiscordChannel, TelegramChannel};
pub use governor::{RiskGovernor, RiskMetrics, RiskMode, RiskStatus};
