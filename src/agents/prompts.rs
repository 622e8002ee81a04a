// =============================================================================
// Agent prompt templates
// =============================================================================
//
// All prompts demand a single strict JSON object (no markdown, no code
// fences); the validation rule set for each agent is spelled out inline so
// the corrective-feedback retry loop has something concrete to point back
// to.
// =============================================================================

use super::graph::CycleState;
use super::report::AgentKind;

const JSON_ONLY: &str = "Respond with ONE JSON object only. No markdown, no code \
fences, no text before or after the object.";

/// Build the (system, user) prompt pair for one agent over the relevant
/// slice of the cycle state. `memory` carries retrieved past experiences
/// (decision agent only).
pub fn build_prompt(kind: AgentKind, state: &CycleState, memory: Option<&str>) -> (String, String) {
    match kind {
        AgentKind::Technical => technical(state),
        AgentKind::Qabba => qabba(state),
        AgentKind::Sentiment => sentiment(state),
        AgentKind::Visual => visual(state),
        AgentKind::Decision => decision(state, memory),
        AgentKind::Risk => risk(state),
    }
}

/// Format one indicator value, "n/a" when absent.
fn ind(state: &CycleState, name: &str) -> String {
    state
        .indicators
        .get(name)
        .map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"))
}

fn report_json<T: serde::Serialize>(report: &Option<T>) -> String {
    report
        .as_ref()
        .and_then(|r| serde_json::to_string(r).ok())
        .unwrap_or_else(|| "null".to_string())
}

fn technical(state: &CycleState) -> (String, String) {
    let system = format!(
        "You are the technical analysis agent of a crypto futures trading desk. \
         Output schema: {{\"signal\": \"BUY\"|\"SELL\"|\"HOLD\", \
         \"confidence\": \"HIGH\"|\"MEDIUM\"|\"LOW\", \"reason\": \"...\"}}. {JSON_ONLY}"
    );

    let user = format!(
        "Symbol: {} @ {}\nPrice: {:.4}  Volume: {:.2}\n\
         RSI(14): {}\nMACD line: {}  signal: {}  histogram: {}\n\
         ADX: {}  +DI: {}  -DI: {}\n\
         EMA9: {}  EMA21: {}  SMA20: {}\nATR: {}  ROC: {}\n\
         SuperTrend: {} ({})\n\n\
         Read the trend and momentum and emit your signal.",
        state.symbol,
        state.timeframe,
        state.current_price,
        state.current_volume,
        ind(state, "rsi"),
        ind(state, "macd_line"),
        ind(state, "macd_signal"),
        ind(state, "macd_histogram"),
        ind(state, "adx"),
        ind(state, "plus_di"),
        ind(state, "minus_di"),
        ind(state, "ema_9"),
        ind(state, "ema_21"),
        ind(state, "sma_20"),
        ind(state, "atr"),
        ind(state, "roc"),
        ind(state, "supertrend"),
        state.indicators.supertrend_direction.unwrap_or("n/a"),
    );

    (system, user)
}

fn qabba(state: &CycleState) -> (String, String) {
    let system = format!(
        "You are the QABBA agent: quantitative analysis of Bollinger bands and \
         order flow. Output schema: {{\"signal\": \"BUY_QABBA\"|\"SELL_QABBA\"|\"HOLD_QABBA\", \
         \"order_flow_bias\": \"buying\"|\"selling\"|\"neutral\", \"reason\": \"...\"}}. {JSON_ONLY}"
    );

    let user = format!(
        "Symbol: {} @ {}\nPrice: {:.4}\n\
         BB upper: {}  middle: {}  lower: {}\n\
         percent_b: {}  bandwidth: {}  band position: {}\n\
         squeeze: {}  bands inside Keltner: {}\n\
         Order book imbalance: {:.4}  CVD: {:.2}\n\
         Spread (bps): {:.3}  Bid depth: {:.2}  Ask depth: {:.2}\n\n\
         Judge the band structure and the order flow.",
        state.symbol,
        state.timeframe,
        state.current_price,
        ind(state, "bb_upper"),
        ind(state, "bb_middle"),
        ind(state, "bb_lower"),
        ind(state, "percent_b"),
        ind(state, "bandwidth"),
        state
            .indicators
            .band_position
            .map_or("n/a", |p| p.as_str()),
        state
            .indicators
            .squeeze
            .map_or_else(|| "n/a".to_string(), |s| s.to_string()),
        state
            .indicators
            .bb_inside_kc
            .map_or_else(|| "n/a".to_string(), |s| s.to_string()),
        state.micro.obi,
        state.micro.cvd,
        state.micro.spread,
        state.micro.bid_depth,
        state.micro.ask_depth,
    );

    (system, user)
}

fn sentiment(state: &CycleState) -> (String, String) {
    let system = format!(
        "You are the market sentiment agent. Output schema: \
         {{\"overall_sentiment\": \"POSITIVE\"|\"NEGATIVE\"|\"NEUTRAL\", \
         \"confidence_score\": 0.0-1.0, \"reason\": \"...\"}}. {JSON_ONLY}"
    );

    let context = state.sentiment_context.as_ref();
    let fear_greed = context
        .and_then(|c| c.fear_greed.as_deref())
        .unwrap_or("unavailable");
    let headlines = context
        .map(|c| {
            if c.headlines.is_empty() {
                "none".to_string()
            } else {
                c.headlines
                    .iter()
                    .map(|h| format!("- {h}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        })
        .unwrap_or_else(|| "none".to_string());

    let user = format!(
        "Symbol: {}\nFear & Greed index: {}\nRecent headlines:\n{}\n\n\
         Assess the prevailing sentiment for this market.",
        state.symbol, fear_greed, headlines,
    );

    (system, user)
}

fn visual(state: &CycleState) -> (String, String) {
    let system = format!(
        "You are the chart-reading agent. A candlestick chart rendering of the \
         recent price action accompanies this request. Output schema: \
         {{\"action\": \"BUY\"|\"SELL\"|\"HOLD\", \
         \"trend_direction\": \"bullish\"|\"bearish\"|\"neutral\", \"reason\": \"...\"}}. {JSON_ONLY}"
    );

    let user = format!(
        "Symbol: {} @ {}\nCurrent price: {:.4}\n\
         Chart attached: {}\n\n\
         Identify the visible structure (trend, ranges, key levels) and emit \
         your action.",
        state.symbol,
        state.timeframe,
        state.current_price,
        if state.chart_b64.is_some() { "yes" } else { "no" },
    );

    (system, user)
}

fn decision(state: &CycleState, memory: Option<&str>) -> (String, String) {
    let system = format!(
        "You are the final decision agent of the trading desk. Weigh every \
         analyst report you are given. Output schema: \
         {{\"final_decision\": \"BUY\"|\"SELL\"|\"HOLD\", \
         \"confidence_in_decision\": \"HIGH\"|\"MEDIUM\"|\"LOW\", \
         \"combined_reasoning\": \"...\"}}. {JSON_ONLY}"
    );

    let memory_section = memory
        .filter(|m| !m.is_empty())
        .map(|m| format!("\nRelevant past experiences:\n{m}\n"))
        .unwrap_or_default();

    let user = format!(
        "Symbol: {} @ {}\nPrice: {:.4}\n\n\
         technical_report: {}\n\
         qabba_report: {}\n\
         sentiment_report: {}\n\
         visual_report: {}\n{}\n\
         Synthesize the reports into one trade decision.",
        state.symbol,
        state.timeframe,
        state.current_price,
        report_json(&state.technical_report),
        report_json(&state.qabba_report),
        report_json(&state.sentiment_report),
        report_json(&state.visual_report),
        memory_section,
    );

    (system, user)
}

fn risk(state: &CycleState) -> (String, String) {
    let system = format!(
        "You are the risk management agent; you run last and may veto. Output \
         schema: {{\"verdict\": \"APPROVE\"|\"APPROVE_REDUCED\"|\"VETO\"|\"DELAY\", \
         \"risk_score\": 0-10, \"reason\": \"...\"}}. {JSON_ONLY}"
    );

    let user = format!(
        "Symbol: {} @ {}\nPrice: {:.4}  ATR: {}\n\
         Proposed decision: {}\n\
         Band position: {}  Spread (bps): {:.3}\n\n\
         Score the risk of acting on this decision now.",
        state.symbol,
        state.timeframe,
        state.current_price,
        ind(state, "atr"),
        report_json(&state.decision_report),
        state
            .indicators
            .band_position
            .map_or("n/a", |p| p.as_str()),
        state.micro.spread,
    );

    (system, user)
}

/// Append corrective feedback after a failed validation round.
pub fn with_feedback(user_prompt: &str, errors: &[String]) -> String {
    let bullets = errors
        .iter()
        .map(|e| format!("- {e}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{user_prompt}\n\nYour previous response was rejected for these reasons:\n\
         {bullets}\nCorrect every issue and respond again with one valid JSON object only."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CycleState {
        let mut s = CycleState::new("BTCUSDT", "15m", 7);
        s.current_price = 37_000.0;
        s.indicators.values.insert("rsi".to_string(), 55.1234);
        s
    }

    #[test]
    fn technical_prompt_substitutes_indicators() {
        let (system, user) = build_prompt(AgentKind::Technical, &state(), None);
        assert!(system.contains("\"signal\""));
        assert!(user.contains("BTCUSDT"));
        assert!(user.contains("RSI(14): 55.1234"));
        assert!(user.contains("MACD line: n/a"));
    }

    #[test]
    fn decision_prompt_embeds_upstream_reports_and_memory() {
        let mut s = state();
        s.technical_report = Some(crate::agents::report::TechnicalReport::fallback());
        let (_, user) = build_prompt(AgentKind::Decision, &s, Some("- past win on squeeze"));
        assert!(user.contains("technical_report: {"));
        assert!(user.contains("qabba_report: null"));
        assert!(user.contains("past win on squeeze"));
    }

    #[test]
    fn feedback_lists_each_error() {
        let augmented = with_feedback(
            "base",
            &["missing required field 'signal'".to_string(), "bad enum".to_string()],
        );
        assert!(augmented.starts_with("base"));
        assert!(augmented.contains("- missing required field 'signal'"));
        assert!(augmented.contains("- bad enum"));
    }

    #[test]
    fn every_kind_builds_a_prompt() {
        let s = state();
        for kind in [
            AgentKind::Technical,
            AgentKind::Qabba,
            AgentKind::Sentiment,
            AgentKind::Visual,
            AgentKind::Decision,
            AgentKind::Risk,
        ] {
            let (system, user) = build_prompt(kind, &s, None);
            assert!(!system.is_empty());
            assert!(user.contains("BTCUSDT"));
        }
    }
}
