// =============================================================================
// Reasoning entry — one stored prompt -> decision trace
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Realized result of the trade a reasoning entry led to. All fields are
/// set together when the outcome is attached; an entry without an outcome
/// is pending evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// P&L of the resulting trade.
    pub reward: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub near_miss: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_notes: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

/// LLM-as-judge verdict attached to an entry after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeFeedback {
    pub verdict: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_estimate: Option<bool>,
    pub judged_at: DateTime<Utc>,
}

/// One prompt -> decision trace for one agent.
///
/// Created at agent invocation and mutated at most twice afterwards:
/// outcome attachment and judge attachment. `prompt_digest` is unique per
/// (agent, prompt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub agent: String,
    pub prompt_digest: String,
    pub prompt: String,
    pub reasoning: String,
    pub action: String,
    /// Normalized decision confidence in [0, 1].
    pub confidence: f64,
    /// Which backend produced the response, e.g. "ollama/qwen2.5:7b".
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeFeedback>,
}

impl ReasoningEntry {
    /// Compact unique handle for a prompt: first 16 hex chars of its
    /// SHA-256.
    pub fn digest_of(prompt: &str) -> String {
        let hash = Sha256::digest(prompt.as_bytes());
        hex::encode(hash)[..16].to_string()
    }

    /// Case-insensitive substring match over prompt and reasoning.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.reasoning.to_lowercase().contains(&q) || self.prompt.to_lowercase().contains(&q)
    }

    /// Similarity against another prompt: cosine when both sides carry
    /// embeddings, Jaccard over whitespace tokens otherwise.
    pub fn similarity(&self, other_prompt: &str, other_embedding: Option<&[f64]>) -> f64 {
        match (&self.embedding, other_embedding) {
            (Some(own), Some(other)) => cosine_similarity(own, other),
            _ => jaccard_similarity(&self.prompt, other_prompt),
        }
    }

    /// Whether this entry has been evaluated against a real trade.
    pub fn is_evaluated(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Token-overlap similarity over lowercase whitespace tokens.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;

    let a_tokens: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let b_tokens: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();

    if a_tokens.is_empty() || b_tokens.is_empty() {
        return 0.0;
    }

    let intersection = a_tokens.intersection(&b_tokens).count();
    let union = a_tokens.union(&b_tokens).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Cosine similarity; 0.0 for mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
