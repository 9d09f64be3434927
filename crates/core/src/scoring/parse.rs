//! Recovering a JSON object from a free-form model response.
//!
//! Instruction models wrap JSON in code fences, add prose around it, run out
//! of tokens mid-object, or annotate values inline. Recovery is tried in
//! increasingly lossy steps; a response nothing can be salvaged from yields
//! an empty object.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields pulled out one by one when the response cannot be repaired.
const PARTIAL_FIELDS: &[&str] = &["overall_score", "summary", "sentiment_score", "agent_summary"];

/// How a response was turned into JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Valid JSON once code fences were stripped.
    Direct,
    /// Parsed after extracting and repairing the object text.
    Repaired,
    /// Only some fields could be extracted.
    Partial,
    /// Nothing usable; the result is empty.
    Failed,
}

impl Recovery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recovery::Direct => "direct",
            Recovery::Repaired => "repaired",
            Recovery::Partial => "partial",
            Recovery::Failed => "failed",
        }
    }
}

/// Parse a model response into a JSON object.
pub fn parse_model_response(text: &str) -> (Value, Recovery) {
    let cleaned = strip_code_fences(text);

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&cleaned) {
        return (value, Recovery::Direct);
    }

    let repaired = repair(&extract_object(&cleaned));
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&repaired) {
        return (value, Recovery::Repaired);
    }

    let partial = extract_fields(&repaired);
    if partial.is_empty() {
        (Value::Object(Map::new()), Recovery::Failed)
    } else {
        (Value::Object(partial), Recovery::Partial)
    }
}

fn replace(re: &str, haystack: &str, with: &str) -> String {
    match Regex::new(re) {
        Ok(re) => re.replace_all(haystack, with).into_owned(),
        Err(_) => haystack.to_string(),
    }
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let without_open = replace(r"^```(?:json)?\s*", trimmed, "");
    replace(r"\s*```$", &without_open, "")
}

/// The text from the first `{` to the last `}`, or all of it.
fn extract_object(text: &str) -> String {
    let Some(first) = text.find('{') else {
        return text.to_string();
    };
    let from_first = &text[first..];
    match from_first.rfind('}') {
        Some(last) => from_first[..=last].to_string(),
        None => from_first.to_string(),
    }
}

/// Close a truncated object and clean up common annotation artifacts.
fn repair(json: &str) -> String {
    let mut json = json.to_string();

    let opens = json.matches('{').count();
    let closes = json.matches('}').count();
    if opens > closes {
        // Cut back to the last point where the structure was complete
        let last_safe = [json.rfind(','), json.rfind('{'), json.rfind('[')]
            .into_iter()
            .flatten()
            .max();
        if let Some(at) = last_safe {
            if json[at..].starts_with(',') {
                json.truncate(at);
            } else {
                json.truncate(at + 1);
            }
        }
        let opens = json.matches('{').count();
        let closes = json.matches('}').count();
        json.push_str(&"}".repeat(opens.saturating_sub(closes)));
    }

    let json = replace(r",\s*([\]}])", &json, "${1}");
    let json = replace(r#":\s*("[^"]*")\s*\([^)]*\)"#, &json, ": ${1}");
    let json = replace(r#":\s*([^,"\s}]+)\s*\([^)]*\)"#, &json, ": ${1}");
    replace(r":\s*N/A\b", &json, r#": "N/A""#)
}

/// Last resort: pick known top-level fields out of broken JSON text.
fn extract_fields(text: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for field in PARTIAL_FIELDS {
        let pattern = format!(r#""{}"\s*:\s*([^,\s}}]+)"#, field);
        let Some(caps) = Regex::new(&pattern).ok().and_then(|re| re.captures(text)) else {
            continue;
        };
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let raw = raw.trim_matches('"');
        let raw = raw.split('(').next().unwrap_or_default().trim();

        let value = if field.contains("score") {
            raw.parse::<f64>()
                .ok()
                .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
                .unwrap_or_else(|| Value::String(raw.to_string()))
        } else {
            Value::String(raw.to_string())
        };
        fields.insert(field.to_string(), value);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        let (value, recovery) = parse_model_response(r#"{"overall_score": 80}"#);
        assert_eq!(value, json!({"overall_score": 80}));
        assert_eq!(recovery, Recovery::Direct);
    }

    #[test]
    fn test_code_fences() {
        let (value, recovery) =
            parse_model_response("```json\n{\"cqs_score\": 70, \"summary\": \"ok\"}\n```");
        assert_eq!(value["cqs_score"], 70);
        assert_eq!(recovery, Recovery::Direct);
    }

    #[test]
    fn test_surrounding_prose() {
        let (value, recovery) = parse_model_response(
            "Here is my evaluation:\n{\"fcr_score\": 90}\nLet me know if you need more.",
        );
        assert_eq!(value, json!({"fcr_score": 90}));
        assert_eq!(recovery, Recovery::Repaired);
    }

    #[test]
    fn test_truncated_object_is_closed() {
        let (value, recovery) = parse_model_response(
            r#"{"cmp_score": 95, "neg_score": 80, "summary": "The agent was cour"#,
        );
        assert_eq!(recovery, Recovery::Repaired);
        assert_eq!(value, json!({"cmp_score": 95, "neg_score": 80}));
    }

    #[test]
    fn test_truncation_cuts_back_to_last_open_brace() {
        // Everything after the last closing brace is dropped first, then the
        // object is cut back to its innermost opening.
        let (value, recovery) = parse_model_response(
            r#"{"cmp_score": 95, "compliance_flags": {"mini_miranda": true}, "neg_score": 8"#,
        );
        assert_eq!(recovery, Recovery::Repaired);
        assert_eq!(value, json!({"cmp_score": 95, "compliance_flags": {}}));
    }

    #[test]
    fn test_trailing_commas_and_comments() {
        let (value, recovery) = parse_model_response(
            r#"{"eff_score": 60 (could be faster), "summary": "Resolved" (mostly), "sat_score": N/A, "tags": ["a", "b",],}"#,
        );
        assert_eq!(recovery, Recovery::Repaired);
        assert_eq!(value["eff_score"], 60);
        assert_eq!(value["summary"], "Resolved");
        assert_eq!(value["sat_score"], "N/A");
        assert_eq!(value["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_partial_field_extraction() {
        let (value, recovery) = parse_model_response(
            r#"{"overall_score": 72 , "summary": "Good call", "pillars": {"a": [1, 2}"#,
        );
        assert_eq!(recovery, Recovery::Partial);
        assert_eq!(value["overall_score"], 72.0);
        assert_eq!(value["summary"], "Good");
    }

    #[test]
    fn test_unrecoverable_is_empty_object() {
        let (value, recovery) = parse_model_response("I cannot evaluate this call.");
        assert_eq!(value, json!({}));
        assert_eq!(recovery, Recovery::Failed);

        let (value, _) = parse_model_response("");
        assert_eq!(value, json!({}));
    }

    #[test]
    fn test_non_object_json_is_not_accepted() {
        let (value, recovery) = parse_model_response("[1, 2, 3]");
        assert_eq!(value, json!({}));
        assert_eq!(recovery, Recovery::Failed);
    }
}
