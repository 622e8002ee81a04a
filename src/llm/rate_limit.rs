// =============================================================================
// Provider Rate Limiter — per-provider request budgets from response headers
// =============================================================================
//
// Inference providers advertise remaining budgets via response headers
// (`x-ratelimit-remaining-requests`, `retry-after`). The limiter keeps one
// budget per provider name; the registry consults it before dispatching and
// providers update it after every response. Unknown budgets allow requests.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Budget below which a warning is emitted.
const REMAINING_WARN_THRESHOLD: i64 = 5;

#[derive(Debug, Default)]
struct ProviderBudget {
    /// Remaining requests reported by the provider; `None` = unknown.
    remaining_requests: Option<i64>,
    /// Do not send before this instant (set on 429 / retry-after).
    blocked_until: Option<Instant>,
}

/// Thread-safe per-provider budget tracker.
#[derive(Default)]
pub struct ProviderRateLimiter {
    budgets: Mutex<HashMap<String, ProviderBudget>>,
}

impl ProviderRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update a provider's budget from HTTP response headers.
    pub fn update_from_headers(&self, provider: &str, headers: &reqwest::header::HeaderMap) {
        let remaining = headers
            .get("x-ratelimit-remaining-requests")
            .or_else(|| headers.get("x-ratelimit-remaining"))
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());

        if let Some(r) = remaining {
            let mut budgets = self.budgets.lock();
            let budget = budgets.entry(provider.to_string()).or_default();
            let prev = budget.remaining_requests;
            budget.remaining_requests = Some(r);

            if r <= REMAINING_WARN_THRESHOLD
                && prev.map_or(true, |p| p > REMAINING_WARN_THRESHOLD)
            {
                warn!(provider, remaining = r, "provider request budget nearly exhausted");
            }
            debug!(provider, remaining = r, "rate-limit budget updated from headers");
        }
    }

    /// Block a provider for `retry_after` (falling back to 30 s) after a 429.
    pub fn mark_rate_limited(&self, provider: &str, retry_after_secs: Option<f64>) {
        let delay = retry_after_secs.unwrap_or(30.0).max(0.0);
        let mut budgets = self.budgets.lock();
        let budget = budgets.entry(provider.to_string()).or_default();
        budget.blocked_until = Some(Instant::now() + Duration::from_secs_f64(delay));
        budget.remaining_requests = Some(0);
        warn!(provider, delay_secs = delay, "provider rate-limited — blocking requests");
    }

    // -------------------------------------------------------------------------
    // Pre-flight check
    // -------------------------------------------------------------------------

    /// Whether a request to `provider` may be sent right now.
    pub fn can_send(&self, provider: &str) -> bool {
        let mut budgets = self.budgets.lock();
        let Some(budget) = budgets.get_mut(provider) else {
            return true;
        };

        if let Some(until) = budget.blocked_until {
            if Instant::now() < until {
                return false;
            }
            // Block expired: forget the stale zero budget.
            budget.blocked_until = None;
            budget.remaining_requests = None;
        }

        budget.remaining_requests.map_or(true, |r| r > 0)
    }

    /// Remaining budget for the dashboard, `None` when unknown.
    pub fn remaining(&self, provider: &str) -> Option<i64> {
        self.budgets
            .lock()
            .get(provider)
            .and_then(|b| b.remaining_requests)
    }
}

impl std::fmt::Debug for ProviderRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let budgets = self.budgets.lock();
        f.debug_struct("ProviderRateLimiter")
            .field("providers", &budgets.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn unknown_provider_can_send() {
        let limiter = ProviderRateLimiter::new();
        assert!(limiter.can_send("openai"));
        assert_eq!(limiter.remaining("openai"), None);
    }

    #[test]
    fn header_update_tracks_remaining() {
        let limiter = ProviderRateLimiter::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-remaining-requests",
            HeaderValue::from_static("3"),
        );
        limiter.update_from_headers("openai", &headers);
        assert_eq!(limiter.remaining("openai"), Some(3));
        assert!(limiter.can_send("openai"));
    }

    #[test]
    fn zero_remaining_blocks_sending() {
        let limiter = ProviderRateLimiter::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-remaining-requests",
            HeaderValue::from_static("0"),
        );
        limiter.update_from_headers("openai", &headers);
        assert!(!limiter.can_send("openai"));
    }

    #[test]
    fn rate_limited_provider_blocks_then_recovers() {
        let limiter = ProviderRateLimiter::new();
        limiter.mark_rate_limited("hf", Some(0.0));
        // Zero-second block expires immediately; the stale zero budget is
        // discarded on the next check.
        assert!(limiter.can_send("hf"));
    }

    #[test]
    fn rate_limited_provider_blocks_for_duration() {
        let limiter = ProviderRateLimiter::new();
        limiter.mark_rate_limited("hf", Some(60.0));
        assert!(!limiter.can_send("hf"));
        // Other providers are unaffected.
        assert!(limiter.can_send("openai"));
    }
}
