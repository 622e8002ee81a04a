// =============================================================================
// Agent response parsing — thinking-marker stripping and tail JSON extraction
// =============================================================================
//
// Models wrapped in reasoning modes emit chain-of-thought before the JSON
// payload. The parser strips `<think>`-style blocks, then extracts the LAST
// balanced JSON object from the tail of the text (string- and escape-aware).
// When nothing parses the result is `{"parse_error": true}`.
// =============================================================================

use tracing::debug;

/// Thinking-block markers stripped before extraction.
const THINKING_TAGS: &[(&str, &str)] = &[
    ("<think>", "</think>"),
    ("<thinking>", "</thinking>"),
    ("<reasoning>", "</reasoning>"),
];

/// ASCII-case-insensitive substring search returning a byte offset.
fn find_ascii_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < from + n.len() {
        return None;
    }
    (from..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// Remove thinking blocks. An unclosed opening tag drops everything from
/// the tag onward (the payload, if any, precedes it in that case).
pub fn strip_thinking(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in THINKING_TAGS {
        loop {
            let Some(start) = find_ascii_ci(&out, open, 0) else {
                break;
            };
            match find_ascii_ci(&out, close, start + open.len()) {
                Some(close_start) => {
                    out.replace_range(start..close_start + close.len(), "");
                }
                None => {
                    out.truncate(start);
                    break;
                }
            }
        }
    }
    out
}

/// Extract the last balanced top-level JSON object from `text`.
///
/// Scans forward tracking brace depth with string/escape awareness,
/// collecting top-level object spans; candidates are parsed from the last
/// span backwards so trailing prose after the object is tolerated.
pub fn extract_last_json_object(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        spans.push((start, i + 1));
                    }
                }
            }
            _ => {}
        }
    }

    for (s, e) in spans.into_iter().rev() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text[s..e]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    None
}

/// Full parse pipeline: strip thinking markers, extract the last object,
/// fall back to a parse-error marker.
pub fn parse_structured_response(text: &str) -> serde_json::Value {
    let cleaned = strip_thinking(text);
    match extract_last_json_object(&cleaned) {
        Some(value) => value,
        None => {
            debug!("no parseable JSON object in agent response");
            serde_json::json!({ "parse_error": true })
        }
    }
}

/// Whether a parsed value is the parse-error marker.
pub fn is_parse_error(value: &serde_json::Value) -> bool {
    value["parse_error"].as_bool() == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_closed_thinking_blocks() {
        let text = "<think>hmm RSI is low</think>{\"signal\": \"BUY\"}";
        let out = strip_thinking(text);
        assert_eq!(out, "{\"signal\": \"BUY\"}");
    }

    #[test]
    fn strips_unclosed_thinking_tail() {
        let text = "{\"signal\": \"HOLD\"}<thinking>and then I wonder";
        let out = strip_thinking(text);
        assert_eq!(out, "{\"signal\": \"HOLD\"}");
    }

    #[test]
    fn strips_multiple_blocks_case_insensitively() {
        let text = "<THINK>a</THINK>x<think>b</think>y";
        assert_eq!(strip_thinking(text), "xy");
    }

    #[test]
    fn extracts_last_object_from_tail() {
        let text = r#"Here is my draft {"signal": "SELL"} but actually: {"signal": "BUY", "confidence": "HIGH"}"#;
        let value = extract_last_json_object(text).unwrap();
        assert_eq!(value["signal"], "BUY");
        assert_eq!(value["confidence"], "HIGH");
    }

    #[test]
    fn tolerates_trailing_prose() {
        let text = r#"{"signal": "HOLD"} — hope that helps!"#;
        let value = extract_last_json_object(text).unwrap();
        assert_eq!(value["signal"], "HOLD");
    }

    #[test]
    fn handles_braces_inside_strings() {
        let text = r#"{"reason": "range is {tight}", "signal": "HOLD"}"#;
        let value = extract_last_json_object(text).unwrap();
        assert_eq!(value["reason"], "range is {tight}");
    }

    #[test]
    fn handles_escaped_quotes_inside_strings() {
        let text = r#"{"reason": "the \"squeeze\" fired", "signal": "BUY"}"#;
        let value = extract_last_json_object(text).unwrap();
        assert_eq!(value["signal"], "BUY");
    }

    #[test]
    fn nested_objects_extract_whole() {
        let text = r#"{"outer": {"inner": 1}, "signal": "SELL"}"#;
        let value = extract_last_json_object(text).unwrap();
        assert_eq!(value["outer"]["inner"], 1);
    }

    #[test]
    fn skips_malformed_tail_for_earlier_valid_object() {
        let text = r#"{"signal": "BUY"} {broken: nope}"#;
        let value = extract_last_json_object(text).unwrap();
        assert_eq!(value["signal"], "BUY");
    }

    #[test]
    fn no_object_yields_parse_error_marker() {
        let parsed = parse_structured_response("the market looks mixed today");
        assert!(is_parse_error(&parsed));

        let parsed = parse_structured_response("[1, 2, 3]");
        assert!(is_parse_error(&parsed));
    }

    #[test]
    fn full_pipeline_with_thinking_and_json() {
        let text = "<think>deliberating...</think>\nFinal answer:\n{\"final_decision\": \"HOLD\", \"confidence_in_decision\": \"LOW\"}";
        let parsed = parse_structured_response(text);
        assert!(!is_parse_error(&parsed));
        assert_eq!(parsed["final_decision"], "HOLD");
    }
}
