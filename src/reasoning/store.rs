// =============================================================================
// Reasoning Store — append-only per-agent JSONL logs with digest index
// =============================================================================
//
// Layout: one `<agent>.jsonl` per agent plus `index.json` with per-agent
// totals. The log is log-structured: stores AND updates append a full
// serialized entry; on load the last record per digest wins. A file is
// compacted (rewritten from memory) once it exceeds twice the in-memory
// cap, keeping appends O(1) amortized. Update-by-digest is O(1) through an
// in-memory digest -> sequence map per agent.
//
// All operations are serialised under one mutex; writes are flushed before
// returning.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry::{JudgeFeedback, Outcome, ReasoningEntry};

/// Default retention per agent (FIFO eviction beyond this).
pub const DEFAULT_MAX_ENTRIES_PER_AGENT: usize = 500;

/// Optional embedding backend. When absent the store falls back to token
/// overlap; nothing else is conditional on embeddings.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Option<Vec<f64>>;
}

/// Judge verdict payload attached via [`ReasoningStore::attach_judge`].
#[derive(Debug, Clone, Default)]
pub struct JudgePayload {
    pub verdict: String,
    pub score: f64,
    pub confidence: Option<f64>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub success_estimate: Option<bool>,
}

/// Aggregate outcome statistics over recent evaluated entries.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SuccessStats {
    pub total_evaluated: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub avg_reward: f64,
    pub total_reward: f64,
}

/// A synthesized "when X, doing Y works" rule.
#[derive(Debug, Clone, Serialize)]
pub struct Strategy {
    #[serde(rename = "type")]
    pub kind: String,
    pub rule: String,
    pub condition: String,
    pub success_rate: f64,
    pub sample_size: usize,
    pub avg_reward: f64,
}

// =============================================================================
// Internals
// =============================================================================

#[derive(Default)]
struct AgentLog {
    entries: VecDeque<ReasoningEntry>,
    /// digest -> absolute sequence number (index = seq - base_seq).
    digest_seq: HashMap<String, u64>,
    /// Sequence number of the front entry.
    base_seq: u64,
    /// Lines currently in the on-disk file (for compaction).
    file_lines: usize,
    loaded: bool,
}

impl AgentLog {
    fn index_of(&self, digest: &str) -> Option<usize> {
        self.digest_seq
            .get(digest)
            .map(|seq| (seq - self.base_seq) as usize)
    }

    fn push(&mut self, entry: ReasoningEntry, cap: usize) {
        let seq = self.base_seq + self.entries.len() as u64;
        self.digest_seq.insert(entry.prompt_digest.clone(), seq);
        self.entries.push_back(entry);

        while self.entries.len() > cap {
            if let Some(evicted) = self.entries.pop_front() {
                self.digest_seq.remove(&evicted.prompt_digest);
            }
            self.base_seq += 1;
        }
    }
}

#[derive(Default, Serialize, serde::Deserialize)]
struct AgentStats {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    last_recorded: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    logs: HashMap<String, AgentLog>,
    stats: HashMap<String, AgentStats>,
}

/// Durable per-agent reasoning log with outcome and judge attachment.
pub struct ReasoningStore {
    dir: PathBuf,
    max_entries_per_agent: usize,
    embedder: Option<Arc<dyn Embedder>>,
    inner: Mutex<StoreInner>,
}

impl ReasoningStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(dir, DEFAULT_MAX_ENTRIES_PER_AGENT, None)
    }

    pub fn open_with(
        dir: impl Into<PathBuf>,
        max_entries_per_agent: usize,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create reasoning dir {}", dir.display()))?;

        let mut inner = StoreInner::default();
        let index_path = dir.join("index.json");
        if let Ok(content) = std::fs::read_to_string(&index_path) {
            match serde_json::from_str::<HashMap<String, AgentStats>>(&content) {
                Ok(stats) => inner.stats = stats,
                Err(e) => warn!(error = %e, "could not parse reasoning index — starting fresh"),
            }
        }

        info!(dir = %dir.display(), max_entries_per_agent, "reasoning store opened");

        Ok(Self {
            dir,
            max_entries_per_agent,
            embedder,
            inner: Mutex::new(inner),
        })
    }

    fn agent_file(&self, agent: &str) -> PathBuf {
        // Agent names are engine-internal identifiers; keep the file name safe
        // against separators anyway.
        let safe: String = agent
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    fn index_file(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    // -------------------------------------------------------------------------
    // Load / persist
    // -------------------------------------------------------------------------

    /// Replay an agent's log from disk: last record per digest wins, FIFO
    /// cap applies in replay order.
    fn ensure_loaded(&self, inner: &mut StoreInner, agent: &str) {
        let log = inner.logs.entry(agent.to_string()).or_default();
        if log.loaded {
            return;
        }
        log.loaded = true;

        let path = self.agent_file(agent);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return;
        };

        let mut lines = 0usize;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            lines += 1;
            match serde_json::from_str::<ReasoningEntry>(line) {
                Ok(entry) => {
                    if let Some(idx) = log.index_of(&entry.prompt_digest) {
                        log.entries[idx] = entry;
                    } else {
                        log.push(entry, self.max_entries_per_agent);
                    }
                }
                Err(e) => {
                    warn!(agent, error = %e, "skipping corrupt reasoning line");
                }
            }
        }
        log.file_lines = lines;
        debug!(agent, entries = log.entries.len(), "reasoning log loaded");
    }

    /// Append one serialized entry line, flushed before return.
    fn append_line(&self, agent: &str, entry: &ReasoningEntry) -> Result<()> {
        let path = self.agent_file(agent);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let line = serde_json::to_string(entry).context("failed to serialize entry")?;
        writeln!(file, "{line}").context("failed to append entry")?;
        file.flush().context("failed to flush entry")?;
        Ok(())
    }

    /// Rewrite an agent file from memory once the log-structured file has
    /// grown past twice the cap.
    fn maybe_compact(&self, log: &mut AgentLog, agent: &str) {
        if log.file_lines <= self.max_entries_per_agent * 2 {
            return;
        }

        let path = self.agent_file(agent);
        let tmp = path.with_extension("jsonl.tmp");

        let mut content = String::new();
        for entry in &log.entries {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    content.push_str(&line);
                    content.push('\n');
                }
                Err(e) => warn!(agent, error = %e, "skipping unserializable entry in compaction"),
            }
        }

        if let Err(e) = std::fs::write(&tmp, &content).and_then(|_| std::fs::rename(&tmp, &path)) {
            warn!(agent, error = %e, "reasoning log compaction failed");
            return;
        }

        log.file_lines = log.entries.len();
        debug!(agent, lines = log.file_lines, "reasoning log compacted");
    }

    fn save_index(&self, inner: &StoreInner) {
        let path = self.index_file();
        match serde_json::to_string_pretty(&inner.stats) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&path, content) {
                    debug!(error = %e, "failed to write reasoning index");
                }
            }
            Err(e) => debug!(error = %e, "failed to serialize reasoning index"),
        }
    }

    // -------------------------------------------------------------------------
    // Store
    // -------------------------------------------------------------------------

    /// Record one agent invocation.
    ///
    /// The action is extracted from `action | final_decision | signal |
    /// decision` (falling back to "UNKNOWN"), confidence from a numeric
    /// `confidence`, the `confidence_in_decision` level (LOW 0.35 /
    /// MEDIUM 0.55 / HIGH 0.8), or `confidence_score`, defaulting to 0.5.
    /// Reasoning text falls back through `reason | reasoning |
    /// combined_reasoning` to a 500-char prefix of the raw response.
    ///
    /// Storing a prompt whose digest already exists updates the existing
    /// entry in place (outcome and judge attachments are preserved).
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        agent: &str,
        prompt: &str,
        normalized_result: &serde_json::Value,
        raw_response: &str,
        backend: &str,
        latency_ms: Option<f64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ReasoningEntry> {
        let digest = ReasoningEntry::digest_of(prompt);
        let action = extract_action(normalized_result);
        let confidence = extract_confidence(normalized_result);
        let reasoning = extract_reasoning(normalized_result, raw_response);

        let embedding = self.embedder.as_ref().and_then(|e| {
            let text = format!("{prompt}\n{reasoning}");
            e.embed(text.trim())
        });

        let mut entry = ReasoningEntry {
            agent: agent.to_string(),
            prompt_digest: digest.clone(),
            prompt: prompt.to_string(),
            reasoning,
            action,
            confidence,
            backend: backend.to_string(),
            latency_ms,
            metadata: metadata.unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
            embedding,
            outcome: None,
            judge: None,
        };

        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner, agent);

        let is_update = {
            let log = inner.logs.get_mut(agent).expect("log just loaded");
            if let Some(idx) = log.index_of(&digest) {
                // Duplicate digest: refresh the trace but keep the original
                // creation time and any attached outcome/judge.
                let existing = &mut log.entries[idx];
                entry.created_at = existing.created_at;
                entry.outcome = existing.outcome.clone();
                entry.judge = existing.judge.clone();
                *existing = entry.clone();
                true
            } else {
                log.push(entry.clone(), self.max_entries_per_agent);
                false
            }
        };

        if let Err(e) = self.append_line(agent, &entry) {
            warn!(agent, error = %e, "failed to persist reasoning entry");
        } else {
            let log = inner.logs.get_mut(agent).expect("log just loaded");
            log.file_lines += 1;
            self.maybe_compact(log, agent);
        }

        if !is_update {
            let stats = inner.stats.entry(agent.to_string()).or_default();
            stats.total += 1;
            stats.last_recorded = Some(entry.created_at.to_rfc3339());
            self.save_index(&inner);
        }

        Ok(entry)
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    /// The most recent `limit` entries, newest first.
    pub fn get_recent(&self, agent: &str, limit: usize) -> Vec<ReasoningEntry> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner, agent);
        let log = &inner.logs[agent];
        log.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Case-insensitive substring search over prompt and reasoning, newest
    /// first.
    pub fn search(&self, agent: &str, query: &str, limit: usize) -> Vec<ReasoningEntry> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner, agent);
        let log = &inner.logs[agent];
        log.entries
            .iter()
            .rev()
            .filter(|e| e.matches(query))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Experiences relevant to `prompt`, ranked by similarity. Entries with
    /// a successful outcome get a 1.5x boost when `prefer_successful`.
    pub fn relevant_context(
        &self,
        agent: &str,
        prompt: &str,
        limit: usize,
        min_similarity: f64,
        prefer_successful: bool,
    ) -> Vec<ReasoningEntry> {
        let query_embedding = self.embedder.as_ref().and_then(|e| e.embed(prompt));

        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner, agent);
        let log = &inner.logs[agent];

        let mut scored: Vec<(f64, &ReasoningEntry)> = log
            .entries
            .iter()
            .filter_map(|e| {
                let mut score = e.similarity(prompt, query_embedding.as_deref());
                if score < min_similarity {
                    return None;
                }
                if prefer_successful && e.outcome.as_ref().is_some_and(|o| o.success) {
                    score *= 1.5;
                }
                Some((score, e))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, e)| e.clone()).collect()
    }

    /// Success statistics over the last `lookback` entries; entries without
    /// an outcome are excluded from the denominator.
    pub fn get_success_rate(&self, agent: &str, lookback: usize) -> SuccessStats {
        let recent = self.get_recent(agent, lookback);
        let evaluated: Vec<&ReasoningEntry> =
            recent.iter().filter(|e| e.is_evaluated()).collect();

        if evaluated.is_empty() {
            return SuccessStats::default();
        }

        let successful = evaluated
            .iter()
            .filter(|e| e.outcome.as_ref().is_some_and(|o| o.success))
            .count();
        let total_reward: f64 = evaluated
            .iter()
            .filter_map(|e| e.outcome.as_ref().map(|o| o.reward))
            .sum();

        SuccessStats {
            total_evaluated: evaluated.len(),
            successful,
            success_rate: successful as f64 / evaluated.len() as f64,
            avg_reward: total_reward / evaluated.len() as f64,
            total_reward,
        }
    }

    // -------------------------------------------------------------------------
    // Mutation by digest
    // -------------------------------------------------------------------------

    /// Attach a realized trade outcome. Returns false when the digest is
    /// unknown for this agent.
    #[allow(clippy::too_many_arguments)]
    pub fn update_outcome(
        &self,
        agent: &str,
        digest: &str,
        success: bool,
        reward: f64,
        trade_id: Option<String>,
        reward_signal: Option<f64>,
        near_miss: Option<bool>,
        reward_notes: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner, agent);

        let log = inner.logs.get_mut(agent).expect("log just loaded");
        let Some(idx) = log.index_of(digest) else {
            return false;
        };

        log.entries[idx].outcome = Some(Outcome {
            success,
            reward,
            reward_signal,
            near_miss,
            reward_notes,
            evaluated_at: Utc::now(),
            trade_id,
        });

        let entry = log.entries[idx].clone();
        if let Err(e) = self.append_line(agent, &entry) {
            warn!(agent, error = %e, "failed to persist outcome update");
            return false;
        }
        log.file_lines += 1;
        self.maybe_compact(log, agent);

        info!(agent, digest = &digest[..8.min(digest.len())], success, "reasoning outcome attached");
        true
    }

    /// Attach a judge verdict. Returns false when the digest is unknown.
    pub fn attach_judge(&self, agent: &str, digest: &str, payload: JudgePayload) -> bool {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner, agent);

        let log = inner.logs.get_mut(agent).expect("log just loaded");
        let Some(idx) = log.index_of(digest) else {
            return false;
        };

        log.entries[idx].judge = Some(JudgeFeedback {
            verdict: payload.verdict,
            score: payload.score,
            confidence: payload.confidence,
            notes: payload.notes,
            tags: payload.tags,
            metadata: payload.metadata,
            success_estimate: payload.success_estimate,
            judged_at: Utc::now(),
        });

        let entry = log.entries[idx].clone();
        if let Err(e) = self.append_line(agent, &entry) {
            warn!(agent, error = %e, "failed to persist judge attachment");
            return false;
        }
        log.file_lines += 1;
        self.maybe_compact(log, agent);

        info!(agent, digest = &digest[..8.min(digest.len())], "judge feedback attached");
        true
    }

    // -------------------------------------------------------------------------
    // Strategy synthesis
    // -------------------------------------------------------------------------

    /// Generalizable rules extracted from evaluated experiences: confidence
    /// buckets (high >= 0.8, medium [0.5, 0.8), low < 0.5) and per-action
    /// groups meeting the thresholds.
    pub fn synthesize_strategies(
        &self,
        agent: &str,
        min_success_rate: f64,
        min_sample_size: usize,
    ) -> Vec<Strategy> {
        let recent = self.get_recent(agent, self.max_entries_per_agent);
        let evaluated: Vec<&ReasoningEntry> =
            recent.iter().filter(|e| e.is_evaluated()).collect();

        if evaluated.len() < min_sample_size {
            return Vec::new();
        }

        let mut strategies = Vec::new();

        let bucket_of = |confidence: f64| -> &'static str {
            if confidence >= 0.8 {
                "high"
            } else if confidence >= 0.5 {
                "medium"
            } else {
                "low"
            }
        };

        let summarize = |entries: &[&ReasoningEntry]| -> (f64, f64) {
            let successes: Vec<&&ReasoningEntry> = entries
                .iter()
                .filter(|e| e.outcome.as_ref().is_some_and(|o| o.success))
                .collect();
            let success_rate = successes.len() as f64 / entries.len() as f64;
            let reward_sum: f64 = successes
                .iter()
                .filter_map(|e| e.outcome.as_ref().map(|o| o.reward))
                .sum();
            let avg_reward = reward_sum / successes.len().max(1) as f64;
            (success_rate, avg_reward)
        };

        // --- Confidence buckets ----------------------------------------------
        for bucket in ["high", "medium", "low"] {
            let members: Vec<&ReasoningEntry> = evaluated
                .iter()
                .copied()
                .filter(|e| bucket_of(e.confidence) == bucket)
                .collect();
            if members.len() < min_sample_size {
                continue;
            }
            let (success_rate, avg_reward) = summarize(&members);
            if success_rate >= min_success_rate {
                let condition = match bucket {
                    "high" => "confidence >= 0.8",
                    "medium" => "0.5 <= confidence < 0.8",
                    _ => "confidence < 0.5",
                };
                strategies.push(Strategy {
                    kind: "confidence_threshold".to_string(),
                    rule: format!("{bucket}-confidence decisions perform well"),
                    condition: condition.to_string(),
                    success_rate,
                    sample_size: members.len(),
                    avg_reward,
                });
            }
        }

        // --- Per-action groups -----------------------------------------------
        let mut by_action: HashMap<&str, Vec<&ReasoningEntry>> = HashMap::new();
        for e in &evaluated {
            by_action.entry(e.action.as_str()).or_default().push(e);
        }

        for (action, members) in by_action {
            if members.len() < min_sample_size {
                continue;
            }
            let (success_rate, avg_reward) = summarize(&members);
            if success_rate >= min_success_rate {
                strategies.push(Strategy {
                    kind: "action_strategy".to_string(),
                    rule: format!("action '{action}' is effective"),
                    condition: format!("action == {action}"),
                    success_rate,
                    sample_size: members.len(),
                    avg_reward,
                });
            }
        }

        // Rank by statistical weight: quality x sample size.
        strategies.sort_by(|a, b| {
            let wa = a.success_rate * a.sample_size as f64;
            let wb = b.success_rate * b.sample_size as f64;
            wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
        });

        strategies
    }

    /// Per-agent summary for the dashboard.
    pub fn summarize_agent(&self, agent: &str) -> serde_json::Value {
        let stats = self.get_success_rate(agent, 100);
        let recent = self.get_recent(agent, 3);
        let total = {
            let inner = self.inner.lock();
            inner.stats.get(agent).map_or(0, |s| s.total)
        };

        serde_json::json!({
            "agent": agent,
            "total_reasonings": total,
            "recent_summaries": recent
                .iter()
                .map(|e| e.reasoning.chars().take(200).collect::<String>())
                .collect::<Vec<_>>(),
            "performance": stats,
            "has_evaluated_data": stats.total_evaluated > 0,
        })
    }

    /// Agents with at least one entry on disk or in memory.
    pub fn known_agents(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut agents: Vec<String> = inner.stats.keys().cloned().collect();
        if agents.is_empty() {
            if let Ok(read) = std::fs::read_dir(&self.dir) {
                for dirent in read.flatten() {
                    let name = dirent.file_name().to_string_lossy().to_string();
                    if let Some(agent) = name.strip_suffix(".jsonl") {
                        agents.push(agent.to_string());
                    }
                }
            }
        }
        agents.sort();
        agents.dedup();
        agents
    }

    /// Storage directory (exposed for diagnostics).
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for ReasoningStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningStore")
            .field("dir", &self.dir)
            .field("max_entries_per_agent", &self.max_entries_per_agent)
            .finish()
    }
}

// =============================================================================
// Extraction helpers
// =============================================================================

fn value_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn extract_action(result: &serde_json::Value) -> String {
    for key in ["action", "final_decision", "signal", "decision"] {
        if let Some(s) = result.get(key).and_then(value_to_string) {
            return s;
        }
    }
    "UNKNOWN".to_string()
}

fn extract_confidence(result: &serde_json::Value) -> f64 {
    if let Some(c) = result.get("confidence").and_then(|v| v.as_f64()) {
        return c;
    }

    if let Some(level) = result
        .get("confidence_in_decision")
        .and_then(|v| v.as_str())
    {
        match level.to_uppercase().as_str() {
            "LOW" => return 0.35,
            "MEDIUM" => return 0.55,
            "HIGH" => return 0.8,
            _ => {}
        }
    }

    for key in ["confidence_score", "confidence_level"] {
        if let Some(c) = result.get(key).and_then(|v| v.as_f64()) {
            return c;
        }
    }

    0.5
}

fn extract_reasoning(result: &serde_json::Value, raw_response: &str) -> String {
    for key in ["reason", "reasoning", "combined_reasoning"] {
        if let Some(s) = result.get(key).and_then(value_to_string) {
            return s;
        }
    }
    raw_response.chars().take(500).collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> ReasoningStore {
        ReasoningStore::open(dir).unwrap()
    }

    fn store_simple(store: &ReasoningStore, agent: &str, prompt: &str, action: &str) -> ReasoningEntry {
        store
            .store(
                agent,
                prompt,
                &serde_json::json!({ "action": action, "reason": "test reasoning" }),
                "raw",
                "test-backend",
                Some(12.0),
                None,
            )
            .unwrap()
    }

    // ---- store -------------------------------------------------------------

    #[test]
    fn digest_matches_prompt_and_dedup_on_restore() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let e1 = store_simple(&store, "technical", "prompt one", "BUY");
        assert_eq!(e1.prompt_digest, ReasoningEntry::digest_of("prompt one"));

        // Same (agent, prompt) twice yields one row, not two.
        store_simple(&store, "technical", "prompt one", "SELL");
        let recent = store.get_recent("technical", 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].action, "SELL");

        // And still one row after reload from disk.
        drop(store);
        let store = open(dir.path());
        assert_eq!(store.get_recent("technical", 10).len(), 1);
    }

    #[test]
    fn action_extraction_fallback_chain() {
        assert_eq!(extract_action(&serde_json::json!({ "action": "BUY" })), "BUY");
        assert_eq!(
            extract_action(&serde_json::json!({ "final_decision": "SELL" })),
            "SELL"
        );
        assert_eq!(extract_action(&serde_json::json!({ "signal": "HOLD" })), "HOLD");
        assert_eq!(extract_action(&serde_json::json!({ "decision": "BUY" })), "BUY");
        assert_eq!(extract_action(&serde_json::json!({ "other": 1 })), "UNKNOWN");
        // Empty strings do not satisfy a key.
        assert_eq!(
            extract_action(&serde_json::json!({ "action": "", "signal": "SELL" })),
            "SELL"
        );
    }

    #[test]
    fn confidence_extraction_fallback_chain() {
        assert_eq!(extract_confidence(&serde_json::json!({ "confidence": 0.9 })), 0.9);
        assert_eq!(
            extract_confidence(&serde_json::json!({ "confidence_in_decision": "HIGH" })),
            0.8
        );
        assert_eq!(
            extract_confidence(&serde_json::json!({ "confidence_in_decision": "medium" })),
            0.55
        );
        assert_eq!(
            extract_confidence(&serde_json::json!({ "confidence_in_decision": "LOW" })),
            0.35
        );
        assert_eq!(
            extract_confidence(&serde_json::json!({ "confidence_score": 0.7 })),
            0.7
        );
        assert_eq!(extract_confidence(&serde_json::json!({})), 0.5);
    }

    #[test]
    fn reasoning_falls_back_to_raw_prefix() {
        let long_raw = "x".repeat(600);
        let r = extract_reasoning(&serde_json::json!({}), &long_raw);
        assert_eq!(r.chars().count(), 500);

        let r = extract_reasoning(
            &serde_json::json!({ "combined_reasoning": "combined" }),
            &long_raw,
        );
        assert_eq!(r, "combined");
    }

    // ---- outcome / judge ---------------------------------------------------

    #[test]
    fn outcome_update_by_digest() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let entry = store_simple(&store, "decision", "should we buy?", "BUY");

        assert!(store.update_outcome(
            "decision",
            &entry.prompt_digest,
            true,
            42.0,
            Some("order-1".to_string()),
            None,
            None,
            None,
        ));
        assert!(!store.update_outcome("decision", "unknown-digest", true, 0.0, None, None, None, None));

        let recent = store.get_recent("decision", 1);
        let outcome = recent[0].outcome.as_ref().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.reward, 42.0);
        assert_eq!(outcome.trade_id.as_deref(), Some("order-1"));

        // Outcome survives a reload.
        drop(store);
        let store = open(dir.path());
        let recent = store.get_recent("decision", 1);
        assert!(recent[0].outcome.as_ref().unwrap().success);
    }

    #[test]
    fn judge_attachment_by_digest() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let entry = store_simple(&store, "decision", "judge me", "HOLD");

        assert!(store.attach_judge(
            "decision",
            &entry.prompt_digest,
            JudgePayload {
                verdict: "ALIGNED".to_string(),
                score: 0.85,
                confidence: Some(0.7),
                notes: Some("sound logic".to_string()),
                tags: vec!["momentum".to_string()],
                metadata: serde_json::Value::Null,
                success_estimate: Some(true),
            },
        ));
        assert!(!store.attach_judge("decision", "nope", JudgePayload::default()));

        let judge = store.get_recent("decision", 1)[0].judge.clone().unwrap();
        assert_eq!(judge.verdict, "ALIGNED");
        assert_eq!(judge.score, 0.85);
    }

    // ---- stats -------------------------------------------------------------

    #[test]
    fn success_rate_excludes_unevaluated() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        for i in 0..4 {
            store_simple(&store, "decision", &format!("prompt {i}"), "BUY");
        }
        let recent = store.get_recent("decision", 10);
        // Evaluate two of four: one win (+10), one loss (-5).
        store.update_outcome("decision", &recent[0].prompt_digest, true, 10.0, None, None, None, None);
        store.update_outcome("decision", &recent[1].prompt_digest, false, -5.0, None, None, None, None);

        let stats = store.get_success_rate("decision", 100);
        assert_eq!(stats.total_evaluated, 2);
        assert_eq!(stats.successful, 1);
        assert!((stats.success_rate - 0.5).abs() < 1e-12);
        assert!((stats.total_reward - 5.0).abs() < 1e-12);
        assert!((stats.avg_reward - 2.5).abs() < 1e-12);
    }

    #[test]
    fn fifo_eviction_respects_cap() {
        let dir = tempdir().unwrap();
        let store = ReasoningStore::open_with(dir.path(), 3, None).unwrap();

        for i in 0..5 {
            store_simple(&store, "technical", &format!("prompt {i}"), "HOLD");
        }

        let recent = store.get_recent("technical", 10);
        assert_eq!(recent.len(), 3);
        // Newest first; the oldest two were evicted.
        assert!(recent[0].prompt.contains("4"));
        assert!(recent[2].prompt.contains("2"));

        // An evicted digest can no longer be updated.
        let evicted = ReasoningEntry::digest_of("prompt 0");
        assert!(!store.update_outcome("technical", &evicted, true, 0.0, None, None, None, None));
    }

    #[test]
    fn created_at_is_monotonic_per_agent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for i in 0..5 {
            store_simple(&store, "technical", &format!("prompt {i}"), "HOLD");
        }
        let mut recent = store.get_recent("technical", 10);
        recent.reverse(); // oldest first
        for pair in recent.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    // ---- search / relevance ------------------------------------------------

    #[test]
    fn search_matches_substring_case_insensitive() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store_simple(&store, "technical", "RSI oversold setup", "BUY");
        store_simple(&store, "technical", "MACD crossover forming", "SELL");

        let hits = store.search("technical", "rsi", 10);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].prompt.contains("RSI"));
        assert!(store.search("technical", "bollinger", 10).is_empty());
    }

    #[test]
    fn relevant_context_ranks_by_overlap_and_boosts_success() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let similar = store_simple(&store, "decision", "btc momentum breakout long entry", "BUY");
        store_simple(&store, "decision", "eth ranging chop sideways market", "HOLD");
        let also_similar =
            store_simple(&store, "decision", "btc momentum breakout short entry", "SELL");

        // Mark the SELL trace successful so the boost reorders it first.
        store.update_outcome("decision", &also_similar.prompt_digest, true, 5.0, None, None, None, None);

        let hits = store.relevant_context("decision", "btc momentum breakout entry", 2, 0.3, true);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].prompt_digest, also_similar.prompt_digest);
        assert_eq!(hits[1].prompt_digest, similar.prompt_digest);
    }

    #[test]
    fn relevant_context_respects_min_similarity() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store_simple(&store, "decision", "completely unrelated words here", "HOLD");
        let hits = store.relevant_context("decision", "btc breakout", 5, 0.3, true);
        assert!(hits.is_empty());
    }

    // ---- strategies --------------------------------------------------------

    #[test]
    fn synthesize_strategies_finds_confident_action_rules() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        // 10 evaluated BUY entries at high confidence, 8 wins.
        for i in 0..10 {
            let entry = store
                .store(
                    "decision",
                    &format!("bullish setup {i}"),
                    &serde_json::json!({ "action": "BUY", "confidence": 0.9, "reason": "r" }),
                    "raw",
                    "test",
                    None,
                    None,
                )
                .unwrap();
            store.update_outcome(
                "decision",
                &entry.prompt_digest,
                i < 8,
                if i < 8 { 10.0 } else { -5.0 },
                None,
                None,
                None,
                None,
            );
        }

        let strategies = store.synthesize_strategies("decision", 0.65, 10);
        assert!(!strategies.is_empty());
        assert!(strategies.iter().any(|s| s.kind == "confidence_threshold"));
        let action = strategies
            .iter()
            .find(|s| s.kind == "action_strategy")
            .expect("action strategy expected");
        assert_eq!(action.condition, "action == BUY");
        assert!((action.success_rate - 0.8).abs() < 1e-12);
        assert_eq!(action.sample_size, 10);
        assert!((action.avg_reward - 10.0).abs() < 1e-12);
    }

    #[test]
    fn synthesize_strategies_needs_minimum_sample() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let entry = store_simple(&store, "decision", "only one", "BUY");
        store.update_outcome("decision", &entry.prompt_digest, true, 1.0, None, None, None, None);
        assert!(store.synthesize_strategies("decision", 0.5, 10).is_empty());
    }

    // ---- compaction --------------------------------------------------------

    #[test]
    fn log_compacts_after_many_updates() {
        let dir = tempdir().unwrap();
        let store = ReasoningStore::open_with(dir.path(), 4, None).unwrap();

        let entry = store_simple(&store, "technical", "base prompt", "HOLD");
        // Each outcome update appends a line; the file must stay bounded.
        for i in 0..50 {
            store.update_outcome(
                "technical",
                &entry.prompt_digest,
                i % 2 == 0,
                i as f64,
                None,
                None,
                None,
                None,
            );
        }

        let content = std::fs::read_to_string(dir.path().join("technical.jsonl")).unwrap();
        let lines = content.lines().count();
        assert!(lines <= 9, "file should be compacted, has {lines} lines");

        // Reload sees exactly one entry with the last outcome.
        drop(store);
        let store = ReasoningStore::open_with(dir.path(), 4, None).unwrap();
        let recent = store.get_recent("technical", 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].outcome.as_ref().unwrap().reward, 49.0);
    }

    // ---- embeddings --------------------------------------------------------

    struct ToyEmbedder;

    impl Embedder for ToyEmbedder {
        fn embed(&self, text: &str) -> Option<Vec<f64>> {
            // Two dimensions: contains "bull", contains "bear".
            Some(vec![
                text.contains("bull") as u8 as f64,
                text.contains("bear") as u8 as f64,
            ])
        }
    }

    #[test]
    fn embedder_drives_cosine_ranking() {
        let dir = tempdir().unwrap();
        let store =
            ReasoningStore::open_with(dir.path(), 100, Some(Arc::new(ToyEmbedder))).unwrap();

        store_simple(&store, "decision", "bull flag forming", "BUY");
        store_simple(&store, "decision", "bear divergence visible", "SELL");

        let hits = store.relevant_context("decision", "bull continuation", 1, 0.5, false);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].prompt.contains("bull"));
    }
}
