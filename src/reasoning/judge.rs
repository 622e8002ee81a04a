// =============================================================================
// Reasoning Judge — LLM-as-judge verdicts over stored decision traces
// =============================================================================
//
// Best-effort: judge failures are logged and skipped, never propagated into
// the trading cycle.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::entry::ReasoningEntry;
use super::store::{JudgePayload, ReasoningStore};
use crate::agents::parser;
use crate::config::ProviderModel;
use crate::llm::{GenerationParams, ProviderRegistry};

/// Per-judgement generation timeout.
const JUDGE_TIMEOUT_SECS: u64 = 30;

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict trading-reasoning auditor. \
Respond with a single JSON object only: \
{\"verdict\": \"ALIGNED\"|\"MIXED\"|\"FLAWED\", \"score\": 0.0-1.0, \
\"confidence\": 0.0-1.0, \"notes\": \"...\", \"tags\": [\"...\"], \
\"success_estimate\": true|false}. No markdown, no extra text.";

/// Asks the generation layer to grade a reasoning trace and attaches the
/// verdict to the store.
pub struct ReasoningJudge {
    registry: Arc<ProviderRegistry>,
    chain: Vec<ProviderModel>,
}

impl ReasoningJudge {
    pub fn new(registry: Arc<ProviderRegistry>, chain: Vec<ProviderModel>) -> Self {
        Self { registry, chain }
    }

    /// Grade one entry. Returns `None` on any generation or parse failure.
    pub async fn judge(&self, entry: &ReasoningEntry) -> Option<JudgePayload> {
        let prompt = format!(
            "Audit this trading decision trace.\n\nAgent: {}\nAction: {}\n\
             Stated confidence: {:.2}\nReasoning:\n{}\n\n\
             Grade whether the reasoning supports the action.",
            entry.agent, entry.action, entry.confidence, entry.reasoning
        );

        let params = GenerationParams {
            max_tokens: 512,
            temperature: 0.1,
            system_prompt: Some(JUDGE_SYSTEM_PROMPT.to_string()),
        };

        let generation = match tokio::time::timeout(
            Duration::from_secs(JUDGE_TIMEOUT_SECS),
            self.registry.generate_with_fallback(&self.chain, &prompt, &params),
        )
        .await
        {
            Ok(Ok(g)) => g,
            Ok(Err(e)) => {
                warn!(agent = %entry.agent, error = %e, "judge generation failed");
                return None;
            }
            Err(_) => {
                warn!(agent = %entry.agent, "judge generation timed out");
                return None;
            }
        };

        let parsed = parser::parse_structured_response(&generation.text);
        if parser::is_parse_error(&parsed) {
            warn!(agent = %entry.agent, "judge response was not parseable JSON");
            return None;
        }

        let verdict = parsed["verdict"].as_str().unwrap_or("MIXED").to_uppercase();
        if !matches!(verdict.as_str(), "ALIGNED" | "MIXED" | "FLAWED") {
            warn!(verdict = %verdict, "judge returned unknown verdict");
            return None;
        }

        Some(JudgePayload {
            verdict,
            score: parsed["score"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
            confidence: parsed["confidence"].as_f64(),
            notes: parsed["notes"].as_str().map(String::from),
            tags: parsed["tags"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            metadata: serde_json::Value::Null,
            success_estimate: parsed["success_estimate"].as_bool(),
        })
    }

    /// Grade an entry and attach the verdict to the store. Returns whether
    /// an attachment happened.
    pub async fn judge_and_attach(&self, store: &ReasoningStore, entry: &ReasoningEntry) -> bool {
        let Some(payload) = self.judge(entry).await else {
            return false;
        };
        let attached = store.attach_judge(&entry.agent, &entry.prompt_digest, payload);
        if attached {
            debug!(agent = %entry.agent, digest = %entry.prompt_digest, "entry judged");
        }
        attached
    }
}

impl std::fmt::Debug for ReasoningJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningJudge")
            .field("chain", &self.chain.len())
            .finish()
    }
}
