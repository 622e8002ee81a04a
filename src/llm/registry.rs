// =============================================================================
// Provider Registry — named backends with ordered fallback chains
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::rate_limit::ProviderRateLimiter;
use super::{Generation, GenerationError, GenerationParams, TextGenerator};
use crate::config::ProviderModel;

/// Aggregate request counters for the dashboard.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GenerationStats {
    pub requests: u64,
    pub fallbacks: u64,
    pub errors: u64,
}

/// Maps provider name -> implementation and drives fallback chains.
pub struct ProviderRegistry {
    providers: Mutex<HashMap<String, Arc<dyn TextGenerator>>>,
    limiter: Arc<ProviderRateLimiter>,
    stats: Mutex<GenerationStats>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            limiter: Arc::new(ProviderRateLimiter::new()),
            stats: Mutex::new(GenerationStats::default()),
        }
    }

    /// The shared rate limiter; providers update it from response headers.
    pub fn limiter(&self) -> Arc<ProviderRateLimiter> {
        self.limiter.clone()
    }

    pub fn register(&self, provider: Arc<dyn TextGenerator>) {
        let name = provider.name().to_string();
        info!(provider = %name, "text-generation provider registered");
        self.providers.lock().insert(name, provider);
    }

    pub fn available(&self) -> Vec<String> {
        self.providers.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> GenerationStats {
        *self.stats.lock()
    }

    /// Run one generation through an ordered (provider, model) chain.
    ///
    /// Rate-limit and model-invalid errors advance the chain; transport
    /// errors bubble immediately. Unregistered or budget-exhausted
    /// providers are skipped. When every entry is exhausted the last
    /// fallback-eligible error is returned.
    pub async fn generate_with_fallback(
        &self,
        chain: &[ProviderModel],
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GenerationError> {
        self.stats.lock().requests += 1;

        let mut last_error: Option<GenerationError> = None;

        for (i, entry) in chain.iter().enumerate() {
            let provider = {
                let providers = self.providers.lock();
                providers.get(&entry.provider).cloned()
            };

            let Some(provider) = provider else {
                warn!(provider = %entry.provider, "provider not registered — skipping");
                continue;
            };

            if !self.limiter.can_send(&entry.provider) {
                debug!(provider = %entry.provider, "provider budget exhausted — skipping");
                last_error = Some(GenerationError::RateLimited {
                    retry_after_secs: None,
                });
                continue;
            }

            match provider.generate(&entry.model, prompt, params).await {
                Ok(generation) => {
                    if i > 0 {
                        self.stats.lock().fallbacks += 1;
                        info!(
                            provider = %entry.provider,
                            model = %entry.model,
                            position = i,
                            "fallback provider succeeded"
                        );
                    }
                    return Ok(generation);
                }
                Err(e) if e.is_fallback_eligible() => {
                    warn!(
                        provider = %entry.provider,
                        model = %entry.model,
                        error = %e,
                        "generation failed — trying next fallback"
                    );
                    if let GenerationError::RateLimited { retry_after_secs } = &e {
                        self.limiter.mark_rate_limited(&entry.provider, *retry_after_secs);
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    // Transport errors bubble without consuming fallbacks.
                    self.stats.lock().errors += 1;
                    return Err(e);
                }
            }
        }

        self.stats.lock().errors += 1;
        Err(last_error.unwrap_or_else(|| {
            GenerationError::Transport(anyhow::anyhow!("no usable provider in fallback chain"))
        }))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available())
            .finish()
    }
}
