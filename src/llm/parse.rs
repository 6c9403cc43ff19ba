//! Defensive parsing of classifier output.
//!
//! Malformed output never fails: missing or invalid fields fall back to
//! conservative defaults.

use serde_json::Value;
use tracing::warn;

use crate::llm::provider::Classification;
use crate::pipeline::types::{Priority, Recommendation};

pub const DEFAULT_CONFIDENCE: f64 = 0.5;
pub const UNPARSEABLE_REASONING: &str = "Unable to parse classifier response";
const NO_REASONING: &str = "No reasoning provided";

/// The classification used when nothing usable can be read.
pub fn default_classification(reasoning: &str) -> Classification {
    Classification {
        recommendation: Recommendation::Keep,
        confidence: DEFAULT_CONFIDENCE,
        category: "unknown".to_string(),
        priority: Priority::Medium,
        reasoning: reasoning.to_string(),
    }
}

/// Outermost `{...}` span of `text`.
fn object_bounds(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Contents of the first markdown fence, without a `json` language tag.
fn fenced_body(text: &str) -> Option<&str> {
    let (_, after) = text.split_once("```")?;
    let (inner, _) = after.split_once("```")?;
    Some(inner.strip_prefix("json").unwrap_or(inner))
}

/// The JSON object in model output: inside a fence if there is one, else
/// anywhere in the text.
fn json_slice(text: &str) -> Option<&str> {
    fenced_body(text)
        .and_then(object_bounds)
        .or_else(|| object_bounds(text))
}

fn parse_confidence(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

fn non_empty_str<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Turn raw classifier text into a validated `Classification`.
pub fn parse_classification(text: &str) -> Classification {
    let parsed = match json_slice(text).map(serde_json::from_str::<Value>) {
        Some(Ok(v @ Value::Object(_))) => v,
        _ => {
            warn!(
                response = %text.chars().take(200).collect::<String>(),
                "Classifier response is not a JSON object, using defaults"
            );
            return default_classification(UNPARSEABLE_REASONING);
        }
    };

    let Some(raw_recommendation) = parsed.get("recommendation") else {
        warn!("Classifier response missing 'recommendation', using defaults");
        return default_classification(UNPARSEABLE_REASONING);
    };

    let recommendation = raw_recommendation
        .as_str()
        .and_then(|s| s.parse::<Recommendation>().ok())
        .unwrap_or_else(|| {
            warn!(value = %raw_recommendation, "Invalid recommendation, defaulting to keep");
            Recommendation::Keep
        });

    let confidence = parse_confidence(
        parsed
            .get("confidence_score")
            .or_else(|| parsed.get("confidence")),
    );

    let priority = non_empty_str(parsed.get("priority"))
        .and_then(|s| s.parse::<Priority>().ok())
        .unwrap_or(Priority::Medium);

    Classification {
        recommendation,
        confidence,
        category: non_empty_str(parsed.get("category"))
            .unwrap_or("unknown")
            .to_string(),
        priority,
        reasoning: non_empty_str(parsed.get("reasoning"))
            .unwrap_or(NO_REASONING)
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_slice_prefers_fenced_body() {
        let input = "Here's the result:\n```json\n{\"recommendation\": \"keep\"}\n```\n{not this}";
        assert_eq!(json_slice(input), Some("{\"recommendation\": \"keep\"}"));
        assert_eq!(json_slice("```\n{\"a\": 1}\n```"), Some("{\"a\": 1}"));
    }

    #[test]
    fn json_slice_finds_object_in_prose() {
        let input = "Sure! {\"recommendation\": \"delete\"} Hope that helps.";
        assert_eq!(json_slice(input), Some("{\"recommendation\": \"delete\"}"));
        assert_eq!(json_slice("```\nno object\n``` then {\"a\": 2}"), Some("{\"a\": 2}"));
        assert_eq!(json_slice("no braces here"), None);
        assert_eq!(json_slice("} backwards {"), None);
    }

    #[test]
    fn parses_complete_response() {
        let c = parse_classification(
            r#"{"recommendation": "delete", "confidence_score": 0.97, "reasoning": "Old digest", "category": "newsletter", "priority": "low"}"#,
        );
        assert_eq!(c.recommendation, Recommendation::Delete);
        assert_eq!(c.confidence, 0.97);
        assert_eq!(c.category, "newsletter");
        assert_eq!(c.priority, Priority::Low);
        assert_eq!(c.reasoning, "Old digest");
    }

    #[test]
    fn non_json_yields_defaults() {
        let c = parse_classification("I think you should keep it.");
        assert_eq!(c, default_classification(UNPARSEABLE_REASONING));
    }

    #[test]
    fn missing_recommendation_yields_defaults() {
        let c = parse_classification(r#"{"confidence_score": 0.9, "category": "spam"}"#);
        assert_eq!(c.category, "unknown");
        assert_eq!(c.confidence, 0.5);
        assert_eq!(c.reasoning, UNPARSEABLE_REASONING);
    }

    #[test]
    fn invalid_recommendation_becomes_keep() {
        let c = parse_classification(r#"{"recommendation": "shred", "confidence_score": 0.8}"#);
        assert_eq!(c.recommendation, Recommendation::Keep);
        assert_eq!(c.confidence, 0.8);
        assert_eq!(c.reasoning, "No reasoning provided");
        assert_eq!(c.priority, Priority::Medium);
    }

    #[test]
    fn confidence_variants() {
        let c = parse_classification(r#"{"recommendation": "keep", "confidence": "0.7"}"#);
        assert_eq!(c.confidence, 0.7);

        let c = parse_classification(r#"{"recommendation": "keep", "confidence_score": 3.5}"#);
        assert_eq!(c.confidence, 1.0);

        let c = parse_classification(r#"{"recommendation": "keep", "confidence_score": -1}"#);
        assert_eq!(c.confidence, 0.0);

        let c = parse_classification(r#"{"recommendation": "keep", "confidence_score": "high"}"#);
        assert_eq!(c.confidence, 0.5);
    }

    #[test]
    fn invalid_priority_is_medium() {
        let c = parse_classification(
            r#"```json
{"recommendation": "ARCHIVE", "priority": "urgent", "category": ""}
```"#,
        );
        assert_eq!(c.recommendation, Recommendation::Archive);
        assert_eq!(c.priority, Priority::Medium);
        assert_eq!(c.category, "unknown");
    }
}
