// =============================================================================
// Agent Orchestration — typed reports, response parsing, prompt templates,
// and the analysis graph
// =============================================================================

pub mod graph;
pub mod parser;
pub mod prompts;
pub mod report;

pub use graph::{CycleState, TradingGraph};
pub use report::{
    AgentKind, Confidence, DecisionReport, FlowBias, QabbaReport, QabbaSignal, RiskReport,
    RiskVerdict, SentimentLabel, SentimentReport, Signal, TechnicalReport, TrendDirection,
    VisualReport,
};
