// =============================================================================
// Agent reports — tagged variants with validating constructors
// =============================================================================
//
// Each agent kind has a fixed required field set and enum constraints. The
// constructors validate a parsed JSON value and either succeed or return
// the full list of violations (used verbatim as corrective feedback on
// retry). Fallback constructors produce the minimal structurally-valid
// HOLD/UNKNOWN report emitted after retries are exhausted.
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Agent kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AgentKind {
    Technical,
    Qabba,
    Sentiment,
    Visual,
    Decision,
    Risk,
}

impl AgentKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::Qabba => "qabba",
            Self::Sentiment => "sentiment",
            Self::Visual => "visual",
            Self::Decision => "decision",
            Self::Risk => "risk",
        }
    }

    /// Key under which this agent's report is merged into the cycle state.
    pub fn report_key(self) -> &'static str {
        match self {
            Self::Technical => "technical_report",
            Self::Qabba => "qabba_report",
            Self::Sentiment => "sentiment_report",
            Self::Visual => "visual_report",
            Self::Decision => "decision_report",
            Self::Risk => "risk_assessment",
        }
    }

    /// Default per-call generation timeout. Visual and decision calls get
    /// the largest budget.
    pub fn default_timeout_secs(self) -> u64 {
        match self {
            Self::Technical | Self::Qabba => 20,
            Self::Sentiment => 25,
            Self::Visual | Self::Decision => 30,
            Self::Risk => 15,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Field enums
// =============================================================================

macro_rules! report_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant,)+
        }

        impl $name {
            pub const ALLOWED: &'static [&'static str] = &[$($text),+];

            pub fn as_str(self) -> &'static str {
                match self { $(Self::$variant => $text,)+ }
            }
        }

        impl std::str::FromStr for $name {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(()),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

report_enum!(Signal { Buy => "BUY", Sell => "SELL", Hold => "HOLD" });
report_enum!(Confidence { High => "HIGH", Medium => "MEDIUM", Low => "LOW" });
report_enum!(QabbaSignal {
    BuyQabba => "BUY_QABBA",
    SellQabba => "SELL_QABBA",
    HoldQabba => "HOLD_QABBA",
});
report_enum!(FlowBias { Buying => "buying", Selling => "selling", Neutral => "neutral" });
report_enum!(SentimentLabel {
    Positive => "POSITIVE",
    Negative => "NEGATIVE",
    Neutral => "NEUTRAL",
});
report_enum!(TrendDirection {
    Bullish => "bullish",
    Bearish => "bearish",
    Neutral => "neutral",
});
report_enum!(RiskVerdict {
    Approve => "APPROVE",
    ApproveReduced => "APPROVE_REDUCED",
    Veto => "VETO",
    Delay => "DELAY",
});

// =============================================================================
// Bookkeeping shared by all reports
// =============================================================================

fn is_false(b: &bool) -> bool {
    !b
}

/// Retry/validation bookkeeping carried on every report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMeta {
    #[serde(rename = "_attempts", default)]
    pub attempts: u32,

    #[serde(rename = "_validation_errors", default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    /// Digest of the reasoning-store entry for this invocation.
    #[serde(rename = "_reasoning_digest", default, skip_serializing_if = "Option::is_none")]
    pub reasoning_digest: Option<String>,

    #[serde(rename = "_validation_failed", default, skip_serializing_if = "is_false")]
    pub validation_failed: bool,
}

/// Uniform access to the bookkeeping section across report variants.
pub trait HasMeta {
    fn meta_mut(&mut self) -> &mut ReportMeta;
}

macro_rules! impl_has_meta {
    ($($t:ty),+ $(,)?) => {
        $(impl HasMeta for $t {
            fn meta_mut(&mut self) -> &mut ReportMeta {
                &mut self.meta
            }
        })+
    };
}

// =============================================================================
// Validation helpers
// =============================================================================

fn require_enum<T: std::str::FromStr>(
    value: &serde_json::Value,
    field: &str,
    allowed: &[&str],
    errors: &mut Vec<String>,
) -> Option<T> {
    match value.get(field) {
        None | Some(serde_json::Value::Null) => {
            errors.push(format!("missing required field '{field}'"));
            None
        }
        Some(v) => {
            let text = v.as_str().map(str::trim).unwrap_or_default();
            match text.parse::<T>() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    errors.push(format!(
                        "invalid value for '{field}': got {v}, expected one of {}",
                        allowed.join(", ")
                    ));
                    None
                }
            }
        }
    }
}

fn require_number_in_range(
    value: &serde_json::Value,
    field: &str,
    lo: f64,
    hi: f64,
    errors: &mut Vec<String>,
) -> Option<f64> {
    match value.get(field) {
        None | Some(serde_json::Value::Null) => {
            errors.push(format!("missing required field '{field}'"));
            None
        }
        Some(v) => match v.as_f64() {
            Some(n) if (lo..=hi).contains(&n) => Some(n),
            Some(n) => {
                errors.push(format!(
                    "invalid value for '{field}': {n} is outside [{lo}, {hi}]"
                ));
                None
            }
            None => {
                errors.push(format!(
                    "invalid value for '{field}': expected a number in [{lo}, {hi}]"
                ));
                None
            }
        },
    }
}

fn optional_reason(value: &serde_json::Value) -> Option<String> {
    for key in ["reason", "reasoning", "combined_reasoning"] {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            if !s.trim().is_empty() {
                return Some(s.trim().to_string());
            }
        }
    }
    None
}

/// Validate a parsed value against an agent's rule set without building the
/// report. Empty result means valid.
pub fn validate(kind: AgentKind, value: &serde_json::Value) -> Vec<String> {
    match kind {
        AgentKind::Technical => TechnicalReport::from_value(value).err(),
        AgentKind::Qabba => QabbaReport::from_value(value).err(),
        AgentKind::Sentiment => SentimentReport::from_value(value).err(),
        AgentKind::Visual => VisualReport::from_value(value).err(),
        AgentKind::Decision => DecisionReport::from_value(value).err(),
        AgentKind::Risk => RiskReport::from_value(value).err(),
    }
    .unwrap_or_default()
}

// =============================================================================
// Report variants
// =============================================================================

/// Indicator-driven market read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalReport {
    pub signal: Signal,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub meta: ReportMeta,
}

impl TechnicalReport {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let signal = require_enum::<Signal>(value, "signal", Signal::ALLOWED, &mut errors);
        let confidence =
            require_enum::<Confidence>(value, "confidence", Confidence::ALLOWED, &mut errors);

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            signal: signal.unwrap(),
            confidence: confidence.unwrap(),
            reason: optional_reason(value),
            meta: ReportMeta::default(),
        })
    }

    pub fn fallback() -> Self {
        Self {
            signal: Signal::Hold,
            confidence: Confidence::Low,
            reason: None,
            meta: ReportMeta {
                validation_failed: true,
                ..ReportMeta::default()
            },
        }
    }
}

/// Bollinger/order-flow read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QabbaReport {
    pub signal: QabbaSignal,
    pub order_flow_bias: FlowBias,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub meta: ReportMeta,
}

impl QabbaReport {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let signal =
            require_enum::<QabbaSignal>(value, "signal", QabbaSignal::ALLOWED, &mut errors);
        let bias =
            require_enum::<FlowBias>(value, "order_flow_bias", FlowBias::ALLOWED, &mut errors);

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            signal: signal.unwrap(),
            order_flow_bias: bias.unwrap(),
            reason: optional_reason(value),
            meta: ReportMeta::default(),
        })
    }

    pub fn fallback() -> Self {
        Self {
            signal: QabbaSignal::HoldQabba,
            order_flow_bias: FlowBias::Neutral,
            reason: None,
            meta: ReportMeta {
                validation_failed: true,
                ..ReportMeta::default()
            },
        }
    }
}

/// External sentiment read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentReport {
    pub overall_sentiment: SentimentLabel,
    /// Confidence in [0, 1].
    pub confidence_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub meta: ReportMeta,
}

impl SentimentReport {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let label = require_enum::<SentimentLabel>(
            value,
            "overall_sentiment",
            SentimentLabel::ALLOWED,
            &mut errors,
        );
        let score = require_number_in_range(value, "confidence_score", 0.0, 1.0, &mut errors);

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            overall_sentiment: label.unwrap(),
            confidence_score: score.unwrap(),
            reason: optional_reason(value),
            meta: ReportMeta::default(),
        })
    }

    pub fn fallback() -> Self {
        Self {
            overall_sentiment: SentimentLabel::Neutral,
            confidence_score: 0.0,
            reason: None,
            meta: ReportMeta {
                validation_failed: true,
                ..ReportMeta::default()
            },
        }
    }
}

/// Chart-artifact read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualReport {
    pub action: Signal,
    pub trend_direction: TrendDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub meta: ReportMeta,
}

impl VisualReport {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let action = require_enum::<Signal>(value, "action", Signal::ALLOWED, &mut errors);
        let trend = require_enum::<TrendDirection>(
            value,
            "trend_direction",
            TrendDirection::ALLOWED,
            &mut errors,
        );

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            action: action.unwrap(),
            trend_direction: trend.unwrap(),
            reason: optional_reason(value),
            meta: ReportMeta::default(),
        })
    }

    pub fn fallback() -> Self {
        Self {
            action: Signal::Hold,
            trend_direction: TrendDirection::Neutral,
            reason: None,
            meta: ReportMeta {
                validation_failed: true,
                ..ReportMeta::default()
            },
        }
    }
}

/// Synthesis of all upstream reports into the trade decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionReport {
    pub final_decision: Signal,
    pub confidence_in_decision: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub meta: ReportMeta,
}

impl DecisionReport {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let decision =
            require_enum::<Signal>(value, "final_decision", Signal::ALLOWED, &mut errors);
        let confidence = require_enum::<Confidence>(
            value,
            "confidence_in_decision",
            Confidence::ALLOWED,
            &mut errors,
        );

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            final_decision: decision.unwrap(),
            confidence_in_decision: confidence.unwrap(),
            reason: optional_reason(value),
            meta: ReportMeta::default(),
        })
    }

    pub fn fallback() -> Self {
        Self {
            final_decision: Signal::Hold,
            confidence_in_decision: Confidence::Low,
            reason: None,
            meta: ReportMeta {
                validation_failed: true,
                ..ReportMeta::default()
            },
        }
    }

    /// Synthetic HOLD emitted when a required upstream agent failed.
    pub fn synthetic_hold(reason: impl Into<String>) -> Self {
        Self {
            final_decision: Signal::Hold,
            confidence_in_decision: Confidence::Low,
            reason: Some(reason.into()),
            meta: ReportMeta::default(),
        }
    }
}

/// Final pre-trade risk gate opinion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskReport {
    pub verdict: RiskVerdict,
    /// Risk score in [0, 10].
    pub risk_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub meta: ReportMeta,
}

impl RiskReport {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let verdict =
            require_enum::<RiskVerdict>(value, "verdict", RiskVerdict::ALLOWED, &mut errors);
        let score = require_number_in_range(value, "risk_score", 0.0, 10.0, &mut errors);

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            verdict: verdict.unwrap(),
            risk_score: score.unwrap(),
            reason: optional_reason(value),
            meta: ReportMeta::default(),
        })
    }

    pub fn fallback() -> Self {
        Self {
            verdict: RiskVerdict::Delay,
            risk_score: 10.0,
            reason: None,
            meta: ReportMeta {
                validation_failed: true,
                ..ReportMeta::default()
            },
        }
    }
}

impl_has_meta!(
    TechnicalReport,
    QabbaReport,
    SentimentReport,
    VisualReport,
    DecisionReport,
    RiskReport,
);

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn technical_report_accepts_valid_values() {
        let report = TechnicalReport::from_value(&json!({
            "signal": "BUY",
            "confidence": "HIGH",
            "reason": "momentum building",
        }))
        .unwrap();
        assert_eq!(report.signal, Signal::Buy);
        assert_eq!(report.confidence, Confidence::High);
        assert_eq!(report.reason.as_deref(), Some("momentum building"));
        assert!(!report.meta.validation_failed);
    }

    #[test]
    fn technical_report_rejects_invalid_enum_with_specific_error() {
        let errors = TechnicalReport::from_value(&json!({
            "signal": "HOLD_LONG",
            "confidence": "HIGH",
        }))
        .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("signal"));
        assert!(errors[0].contains("HOLD_LONG"));
        assert!(errors[0].contains("BUY, SELL, HOLD"));
    }

    #[test]
    fn technical_report_collects_all_errors() {
        let errors = TechnicalReport::from_value(&json!({})).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("'signal'")));
        assert!(errors.iter().any(|e| e.contains("'confidence'")));
    }

    #[test]
    fn qabba_report_enforces_its_own_enum_space() {
        assert!(QabbaReport::from_value(&json!({
            "signal": "BUY_QABBA",
            "order_flow_bias": "buying",
        }))
        .is_ok());

        // Plain BUY is not a QABBA signal.
        let errors = QabbaReport::from_value(&json!({
            "signal": "BUY",
            "order_flow_bias": "buying",
        }))
        .unwrap_err();
        assert!(errors[0].contains("BUY_QABBA"));
    }

    #[test]
    fn sentiment_score_range_is_enforced() {
        assert!(SentimentReport::from_value(&json!({
            "overall_sentiment": "POSITIVE",
            "confidence_score": 0.75,
        }))
        .is_ok());

        let errors = SentimentReport::from_value(&json!({
            "overall_sentiment": "POSITIVE",
            "confidence_score": 1.5,
        }))
        .unwrap_err();
        assert!(errors[0].contains("outside [0, 1]"));
    }

    #[test]
    fn visual_report_validates_action_and_trend() {
        let errors = VisualReport::from_value(&json!({
            "action": "BUY",
            "trend_direction": "UP",
        }))
        .unwrap_err();
        assert!(errors[0].contains("trend_direction"));
        assert!(errors[0].contains("bullish, bearish, neutral"));
    }

    #[test]
    fn risk_report_score_range() {
        assert!(RiskReport::from_value(&json!({
            "verdict": "APPROVE_REDUCED",
            "risk_score": 6.5,
        }))
        .is_ok());

        let errors = RiskReport::from_value(&json!({
            "verdict": "APPROVE",
            "risk_score": 11,
        }))
        .unwrap_err();
        assert!(errors[0].contains("outside [0, 10]"));
    }

    #[test]
    fn decision_report_reads_combined_reasoning() {
        let report = DecisionReport::from_value(&json!({
            "final_decision": "SELL",
            "confidence_in_decision": "MEDIUM",
            "combined_reasoning": "all agents lean bearish",
        }))
        .unwrap();
        assert_eq!(report.reason.as_deref(), Some("all agents lean bearish"));
    }

    #[test]
    fn fallbacks_are_structurally_valid_holds() {
        let t = TechnicalReport::fallback();
        assert_eq!(t.signal, Signal::Hold);
        assert!(t.meta.validation_failed);

        let d = DecisionReport::fallback();
        assert_eq!(d.final_decision, Signal::Hold);
        assert_eq!(d.confidence_in_decision, Confidence::Low);

        let r = RiskReport::fallback();
        assert_eq!(r.verdict, RiskVerdict::Delay);
        assert_eq!(r.risk_score, 10.0);
    }

    #[test]
    fn meta_fields_serialize_with_underscore_names() {
        let mut report = TechnicalReport::fallback();
        report.meta.attempts = 4;
        report.meta.validation_errors = vec!["missing required field 'signal'".to_string()];
        report.meta.reasoning_digest = Some("abcd1234abcd1234".to_string());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["_attempts"], 4);
        assert_eq!(json["_validation_failed"], true);
        assert_eq!(json["_reasoning_digest"], "abcd1234abcd1234");
        assert!(json["_validation_errors"].is_array());
    }

    #[test]
    fn validate_dispatches_per_kind() {
        assert!(validate(AgentKind::Technical, &json!({"signal": "BUY", "confidence": "LOW"}))
            .is_empty());
        assert!(!validate(AgentKind::Decision, &json!({"final_decision": "MAYBE"})).is_empty());
        assert!(validate(
            AgentKind::Risk,
            &json!({"verdict": "VETO", "risk_score": 9.9})
        )
        .is_empty());
    }

    #[test]
    fn report_keys_are_distinct() {
        use std::collections::HashSet;
        let kinds = [
            AgentKind::Technical,
            AgentKind::Qabba,
            AgentKind::Sentiment,
            AgentKind::Visual,
            AgentKind::Decision,
            AgentKind::Risk,
        ];
        let keys: HashSet<&str> = kinds.iter().map(|k| k.report_key()).collect();
        assert_eq!(keys.len(), kinds.len());
    }
}
