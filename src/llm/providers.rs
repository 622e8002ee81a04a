// =============================================================================
// HTTP text-generation providers — OpenAI-compatible and Ollama
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::rate_limit::ProviderRateLimiter;
use super::{Generation, GenerationError, GenerationParams, TextGenerator};

/// Read a retry-after header as seconds.
fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
}

// =============================================================================
// OpenAI-compatible chat endpoint
// =============================================================================

/// Provider for any OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
    limiter: Arc<ProviderRateLimiter>,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        token: Option<String>,
        limiter: Arc<ProviderRateLimiter>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("failed to build reqwest client"),
            limiter,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GenerationError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut messages = Vec::new();
        if let Some(system) = &params.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        let payload = serde_json::json!({
            "model": model_id,
            "messages": messages,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
        });

        let started = Instant::now();
        let mut request = self.client.post(&url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        self.limiter.update_from_headers(&self.name, &headers);

        if status.as_u16() == 429 {
            return Err(GenerationError::RateLimited {
                retry_after_secs: retry_after_secs(&headers),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse chat completion response")?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("").to_string();
            // 404s and "model not found" style 400s mean the model is gone.
            if status.as_u16() == 404 || message.to_lowercase().contains("model") {
                return Err(GenerationError::ModelInvalid(format!(
                    "{model_id}: {message}"
                )));
            }
            return Err(GenerationError::Transport(anyhow::anyhow!(
                "{} returned {status}: {message}",
                self.name
            )));
        }

        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .context("chat completion missing choices[0].message.content")?
            .to_string();

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(provider = %self.name, model = model_id, latency_ms, "generation complete");

        Ok(Generation {
            text,
            provider: self.name.clone(),
            model: model_id.to_string(),
            latency_ms,
        })
    }
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_deref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// Ollama
// =============================================================================

/// Provider for a local or remote Ollama daemon (`/api/generate`).
pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new("http://127.0.0.1:11434")
    }
}

#[async_trait]
impl TextGenerator for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);

        let payload = serde_json::json!({
            "model": model_id,
            "prompt": prompt,
            "system": params.system_prompt,
            "stream": false,
            "options": {
                "num_predict": params.max_tokens,
                "temperature": params.temperature,
            },
        });

        let started = Instant::now();
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ollama response")?;

        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("").to_string();
            if status.as_u16() == 404 || message.to_lowercase().contains("model") {
                return Err(GenerationError::ModelInvalid(format!(
                    "{model_id}: {message}"
                )));
            }
            warn!(status = %status, "ollama request failed");
            return Err(GenerationError::Transport(anyhow::anyhow!(
                "ollama returned {status}: {message}"
            )));
        }

        let text = body["response"]
            .as_str()
            .context("ollama response missing 'response' field")?
            .to_string();

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(model = model_id, latency_ms, "ollama generation complete");

        Ok(Generation {
            text,
            provider: "ollama".to_string(),
            model: model_id.to_string(),
            latency_ms,
        })
    }
}

impl std::fmt::Debug for OllamaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}
