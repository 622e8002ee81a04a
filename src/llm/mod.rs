// =============================================================================
// Text-generation contract
// =============================================================================
//
// The agent graph never talks to an inference backend directly; it goes
// through the `TextGenerator` trait. The error taxonomy is load-bearing:
// rate-limit and model-invalid errors advance the provider fallback chain,
// transport errors bubble to the caller.
// =============================================================================

pub mod providers;
pub mod rate_limit;
pub mod registry;

pub use rate_limit::ProviderRateLimiter;
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use thiserror::Error;

/// Per-call generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f64,
    pub system_prompt: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            system_prompt: None,
        }
    }
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    /// Provider that produced the text (after any fallback).
    pub provider: String,
    pub model: String,
    pub latency_ms: f64,
}

/// Why a generation failed.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Provider request budget exhausted; try the next fallback.
    #[error("rate limited (retry after {retry_after_secs:?} s)")]
    RateLimited { retry_after_secs: Option<f64> },

    /// Model unknown or decommissioned on this provider; try the next
    /// fallback.
    #[error("model invalid: {0}")]
    ModelInvalid(String),

    /// Network/HTTP failure; bubbled to the caller.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl GenerationError {
    /// Whether the fallback chain should advance past this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ModelInvalid(_))
    }
}

/// A text-generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Registry name, e.g. "openai" or "ollama".
    fn name(&self) -> &str;

    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_eligibility() {
        assert!(GenerationError::RateLimited {
            retry_after_secs: Some(1.0)
        }
        .is_fallback_eligible());
        assert!(GenerationError::ModelInvalid("gone".into()).is_fallback_eligible());
        assert!(!GenerationError::Transport(anyhow::anyhow!("boom")).is_fallback_eligible());
    }
}
