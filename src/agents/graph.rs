// =============================================================================
// Trading Graph — agent orchestration with validation, retry, and state merge
// =============================================================================
//
// Canonical node order: technical -> qabba -> (sentiment || visual, both
// optional and config-gated) -> decision -> risk. The single mutable value
// is the CycleState; each agent's report is merged under its own slot, never
// overwriting another's. Sentiment and visual run concurrently against a
// read-only view and rejoin before the decision node.
//
// Per-agent contract: prompt from template, generation through the provider
// fallback chain, thinking-stripped tail-JSON parsing, rule-set validation
// with corrective-feedback retries (exponential backoff, base 1 s), and a
// reasoning-store trace whose digest is stamped onto the report.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::parser;
use super::prompts;
use super::report::{
    self, AgentKind, DecisionReport, HasMeta, QabbaReport, RiskReport, SentimentReport,
    TechnicalReport, VisualReport,
};
use crate::config::{AgentModelConfig, AgentsConfig, LlmConfig};
use crate::indicator_buffer::IndicatorSnapshot;
use crate::llm::{GenerationParams, ProviderRegistry};
use crate::market_data::MicrostructureMetrics;
use crate::reasoning::ReasoningStore;

/// Base backoff between validation retries.
const BACKOFF_BASE_SECS: f64 = 1.0;

/// External sentiment inputs gathered best-effort at cycle start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SentimentContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fear_greed: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headlines: Vec<String>,
}

/// The single mutable value passed node-to-node through one analysis cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleState {
    pub symbol: String,
    pub timeframe: String,
    pub cycle: u64,
    pub thread_id: String,

    #[serde(skip)]
    pub indicators: IndicatorSnapshot,
    pub current_price: f64,
    pub current_volume: f64,
    pub micro: MicrostructureMetrics,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_context: Option<SentimentContext>,
    /// Base64 chart artifact produced externally, if any.
    #[serde(skip)]
    pub chart_b64: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_report: Option<TechnicalReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qabba_report: Option<QabbaReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_report: Option<SentimentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_report: Option<VisualReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_report: Option<DecisionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskReport>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_trade_decision: Option<DecisionReport>,

    /// Seconds spent per node, plus "total".
    pub execution_times: HashMap<String, f64>,
}

impl CycleState {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>, cycle: u64) -> Self {
        let symbol = symbol.into();
        let timeframe = timeframe.into();
        Self {
            thread_id: format!("{symbol}_{timeframe}_{cycle}"),
            symbol,
            timeframe,
            cycle,
            indicators: IndicatorSnapshot::default(),
            current_price: 0.0,
            current_volume: 0.0,
            micro: MicrostructureMetrics::default(),
            sentiment_context: None,
            chart_b64: None,
            technical_report: None,
            qabba_report: None,
            sentiment_report: None,
            visual_report: None,
            decision_report: None,
            risk_assessment: None,
            final_trade_decision: None,
            execution_times: HashMap::new(),
        }
    }
}

/// Result of one agent invocation, before conversion into a typed report.
pub struct AgentRunOutcome {
    pub value: serde_json::Value,
    pub attempts: u32,
    pub errors: Vec<String>,
    pub digest: Option<String>,
    pub failed: bool,
}

/// Stamp attempts/digest/failure bookkeeping onto a report.
fn apply_outcome<T: HasMeta>(mut report: T, outcome: &AgentRunOutcome) -> T {
    let meta = report.meta_mut();
    meta.attempts = outcome.attempts;
    meta.reasoning_digest = outcome.digest.clone();
    if outcome.failed {
        meta.validation_failed = true;
        meta.validation_errors = outcome.errors.clone();
    }
    report
}

/// The agent orchestration graph.
pub struct TradingGraph {
    registry: Arc<ProviderRegistry>,
    store: Arc<ReasoningStore>,
    llm: LlmConfig,
    agents: AgentsConfig,
}

impl TradingGraph {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<ReasoningStore>,
        llm: LlmConfig,
        agents: AgentsConfig,
    ) -> Self {
        Self {
            registry,
            store,
            llm,
            agents,
        }
    }

    fn agent_config(&self, kind: AgentKind) -> AgentModelConfig {
        self.llm.agents.get(kind.name()).cloned().unwrap_or_else(|| AgentModelConfig {
            timeout_secs: kind.default_timeout_secs(),
            ..AgentModelConfig::default()
        })
    }

    // -------------------------------------------------------------------------
    // Graph execution
    // -------------------------------------------------------------------------

    /// Run one full analysis cycle over `state`.
    pub async fn run(&self, mut state: CycleState) -> CycleState {
        let cycle_start = Instant::now();
        info!(thread_id = %state.thread_id, "running agent graph");

        // -- technical ----------------------------------------------------------
        let t0 = Instant::now();
        let outcome = self.invoke_agent(AgentKind::Technical, &state).await;
        let technical_failed = outcome.failed;
        let technical = if outcome.failed {
            TechnicalReport::fallback()
        } else {
            TechnicalReport::from_value(&outcome.value).unwrap_or_else(|_| TechnicalReport::fallback())
        };
        state.technical_report = Some(apply_outcome(technical, &outcome));
        state
            .execution_times
            .insert("technical".to_string(), t0.elapsed().as_secs_f64());

        // -- qabba --------------------------------------------------------------
        let t0 = Instant::now();
        let outcome = self.invoke_agent(AgentKind::Qabba, &state).await;
        let qabba = if outcome.failed {
            QabbaReport::fallback()
        } else {
            QabbaReport::from_value(&outcome.value).unwrap_or_else(|_| QabbaReport::fallback())
        };
        state.qabba_report = Some(apply_outcome(qabba, &outcome));
        state
            .execution_times
            .insert("qabba".to_string(), t0.elapsed().as_secs_f64());

        // -- sentiment || visual (optional branches, merged before decision) ----
        let sentiment_enabled = self.agents.enable_sentiment;
        let visual_enabled = self.agents.enable_visual && state.chart_b64.is_some();

        let t0 = Instant::now();
        let (sentiment_outcome, visual_outcome) = tokio::join!(
            async {
                if sentiment_enabled {
                    Some(self.invoke_agent(AgentKind::Sentiment, &state).await)
                } else {
                    None
                }
            },
            async {
                if visual_enabled {
                    Some(self.invoke_agent(AgentKind::Visual, &state).await)
                } else {
                    None
                }
            },
        );
        let branch_elapsed = t0.elapsed().as_secs_f64();

        if let Some(outcome) = sentiment_outcome {
            if outcome.failed {
                warn!(thread_id = %state.thread_id, "sentiment agent failed — skipping its report");
            } else if let Ok(report) = SentimentReport::from_value(&outcome.value) {
                state.sentiment_report = Some(apply_outcome(report, &outcome));
            }
            state
                .execution_times
                .insert("sentiment".to_string(), branch_elapsed);
        }
        if let Some(outcome) = visual_outcome {
            if outcome.failed {
                warn!(thread_id = %state.thread_id, "visual agent failed — skipping its report");
            } else if let Ok(report) = VisualReport::from_value(&outcome.value) {
                state.visual_report = Some(apply_outcome(report, &outcome));
            }
            state
                .execution_times
                .insert("visual".to_string(), branch_elapsed);
        }

        // -- decision (observes all upstream reports) ---------------------------
        let t0 = Instant::now();
        let outcome = self.invoke_agent(AgentKind::Decision, &state).await;
        let decision_failed = outcome.failed;
        let decision = if outcome.failed {
            DecisionReport::fallback()
        } else {
            DecisionReport::from_value(&outcome.value).unwrap_or_else(|_| DecisionReport::fallback())
        };
        state.decision_report = Some(apply_outcome(decision, &outcome));
        state
            .execution_times
            .insert("decision".to_string(), t0.elapsed().as_secs_f64());

        // -- risk (always last) -------------------------------------------------
        let t0 = Instant::now();
        let outcome = self.invoke_agent(AgentKind::Risk, &state).await;
        let risk = if outcome.failed {
            RiskReport::fallback()
        } else {
            RiskReport::from_value(&outcome.value).unwrap_or_else(|_| RiskReport::fallback())
        };
        state.risk_assessment = Some(apply_outcome(risk, &outcome));
        state
            .execution_times
            .insert("risk".to_string(), t0.elapsed().as_secs_f64());

        // -- final decision -----------------------------------------------------
        state.final_trade_decision = Some(if technical_failed || decision_failed {
            warn!(
                thread_id = %state.thread_id,
                technical_failed,
                decision_failed,
                "required agent failed — emitting synthetic HOLD"
            );
            DecisionReport::synthetic_hold("required upstream agent failed validation")
        } else {
            state.decision_report.clone().expect("decision report just set")
        });

        state
            .execution_times
            .insert("total".to_string(), cycle_start.elapsed().as_secs_f64());

        info!(
            thread_id = %state.thread_id,
            decision = %state
                .final_trade_decision
                .as_ref()
                .map(|d| d.final_decision.as_str())
                .unwrap_or("HOLD"),
            elapsed_s = cycle_start.elapsed().as_secs_f64(),
            "agent graph complete"
        );

        state
    }

    // -------------------------------------------------------------------------
    // Single-agent invocation
    // -------------------------------------------------------------------------

    /// Past experiences injected into the decision prompt, if any are
    /// relevant enough.
    fn recall_memory(&self, state: &CycleState) -> Option<String> {
        let (_, probe) = prompts::build_prompt(AgentKind::Decision, state, None);
        let hits = self
            .store
            .relevant_context(AgentKind::Decision.name(), &probe, 3, 0.3, true);
        if hits.is_empty() {
            return None;
        }
        Some(
            hits.iter()
                .map(|e| {
                    let outcome = match e.outcome.as_ref() {
                        Some(o) if o.success => "won",
                        Some(_) => "lost",
                        None => "pending",
                    };
                    let summary: String = e.reasoning.chars().take(160).collect();
                    format!("- [{}] {} ({})", e.action, summary, outcome)
                })
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    async fn invoke_agent(&self, kind: AgentKind, state: &CycleState) -> AgentRunOutcome {
        let cfg = self.agent_config(kind);
        let memory = if kind == AgentKind::Decision {
            self.recall_memory(state)
        } else {
            None
        };
        let (system, base_user) = prompts::build_prompt(kind, state, memory.as_deref());
        let max_attempts = self.llm.max_retries + 1;

        let mut prompt = base_user.clone();
        let mut attempts = 0u32;
        let mut last_errors: Vec<String> = Vec::new();
        let mut last_value = serde_json::json!({ "parse_error": true });
        let mut last_raw = String::new();
        let mut backend = "none".to_string();
        let mut latency_ms = None;
        let mut failed = true;

        while attempts < max_attempts {
            attempts += 1;

            let params = GenerationParams {
                max_tokens: cfg.max_tokens,
                temperature: cfg.temperature,
                system_prompt: Some(system.clone()),
            };

            match timeout(
                Duration::from_secs(cfg.timeout_secs),
                self.registry
                    .generate_with_fallback(&cfg.providers, &prompt, &params),
            )
            .await
            {
                Ok(Ok(generation)) => {
                    backend = format!("{}/{}", generation.provider, generation.model);
                    latency_ms = Some(generation.latency_ms);
                    last_raw = generation.text.clone();

                    let parsed = parser::parse_structured_response(&generation.text);
                    if parser::is_parse_error(&parsed) {
                        last_errors =
                            vec!["response did not contain a parseable JSON object".to_string()];
                        last_value = parsed;
                    } else {
                        let errors = report::validate(kind, &parsed);
                        last_value = parsed;
                        if errors.is_empty() {
                            last_errors.clear();
                            failed = false;
                            break;
                        }
                        last_errors = errors;
                    }
                }
                Ok(Err(e)) => {
                    last_errors = vec![format!("generation failed: {e}")];
                }
                Err(_) => {
                    last_errors = vec![format!("generation timed out after {} s", cfg.timeout_secs)];
                }
            }

            if attempts >= max_attempts {
                break;
            }

            let backoff = BACKOFF_BASE_SECS * 2f64.powi(attempts as i32 - 1);
            warn!(
                agent = %kind,
                attempt = attempts,
                errors = ?last_errors,
                backoff_s = backoff,
                "agent response rejected — retrying with corrective feedback"
            );
            sleep(Duration::from_secs_f64(backoff)).await;
            prompt = prompts::with_feedback(&base_user, &last_errors);
        }

        if failed {
            warn!(agent = %kind, attempts, errors = ?last_errors, "agent failed after all retries");
        }

        // Trace keyed by the base prompt so the digest is stable per cycle.
        let digest = match self.store.store(
            kind.name(),
            &base_user,
            &last_value,
            &last_raw,
            &backend,
            latency_ms,
            Some(serde_json::json!({ "thread_id": state.thread_id })),
        ) {
            Ok(entry) => Some(entry.prompt_digest),
            Err(e) => {
                error!(agent = %kind, error = %e, "failed to store reasoning entry");
                None
            }
        };

        AgentRunOutcome {
            value: last_value,
            attempts,
            errors: last_errors,
            digest,
            failed,
        }
    }
}

impl std::fmt::Debug for TradingGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingGraph")
            .field("max_retries", &self.llm.max_retries)
            .field("enable_sentiment", &self.agents.enable_sentiment)
            .field("enable_visual", &self.agents.enable_visual)
            .finish()
    }
}
