//! Response Normaliser (C3): turns possibly-noisy LLM text into a
//! `BTreeMap<String, Decision>`, or a reported failure.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::NormalizeError;
use crate::model::Decision;

/// Extracts a JSON object from `raw` and coerces it into per-article
/// decisions, applying the included/score reconciliation invariant.
pub fn normalize(raw: &str) -> Result<BTreeMap<String, Decision>, NormalizeError> {
    let value = extract_json(raw)?;
    let Value::Object(map) = value else {
        return Err(NormalizeError::InvalidStructure);
    };

    let mut out = BTreeMap::new();
    for (article_id, entry) in map {
        let decision = coerce_entry(&article_id, entry)?;
        out.insert(article_id, decision.reconcile());
    }
    Ok(out)
}

fn extract_json(raw: &str) -> Result<Value, NormalizeError> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let fenced = strip_fence(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
        return Ok(value);
    }

    let start = fenced.find('{');
    let end = fenced.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&fenced[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(NormalizeError::NoJsonFound)
}

fn strip_fence(content: &str) -> &str {
    let content = content
        .strip_prefix("```json")
        .or_else(|| content.strip_prefix("```"))
        .unwrap_or(content);
    content.strip_suffix("```").unwrap_or(content)
}

fn coerce_entry(article_id: &str, entry: Value) -> Result<Decision, NormalizeError> {
    let Value::Object(fields) = entry else {
        return Err(NormalizeError::MissingField {
            article_id: article_id.to_string(),
            field: "included",
        });
    };

    let included = match fields.get("included") {
        Some(v) => coerce_bool(v),
        None => {
            return Err(NormalizeError::MissingField {
                article_id: article_id.to_string(),
                field: "included",
            })
        }
    };

    let reason = match fields.get("reason") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => {
            return Err(NormalizeError::MissingField {
                article_id: article_id.to_string(),
                field: "reason",
            })
        }
    };

    let relevance_score = match fields.get("relevance_score").or_else(|| fields.get("relevanceScore")) {
        Some(v) => coerce_score(v),
        None => {
            return Err(NormalizeError::MissingField {
                article_id: article_id.to_string(),
                field: "relevance_score",
            })
        }
    };

    Ok(Decision {
        included,
        reason,
        relevance_score,
    })
}

fn coerce_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            other => !other.is_empty() && other != "0",
        },
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn coerce_score(v: &Value) -> f64 {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.unwrap_or(0.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pure_json() {
        let raw = r#"{"a1":{"included":true,"reason":"Included: good","relevance_score":85}}"#;
        let out = normalize(raw).unwrap();
        assert_eq!(out["a1"].relevance_score, 85.0);
        assert!(out["a1"].included);
    }

    #[test]
    fn strips_markdown_fence() {
        let raw = "```json\n{\"a1\":{\"included\":false,\"reason\":\"Excluded: no\",\"relevanceScore\":10}}\n```";
        let out = normalize(raw).unwrap();
        assert_eq!(out["a1"].relevance_score, 10.0);
    }

    #[test]
    fn locates_object_inside_prose() {
        let raw = "Sure thing, here is the result: {\"a1\":{\"included\":true,\"reason\":\"ok\",\"relevance_score\":\"70%\"}} hope that helps";
        let out = normalize(raw).unwrap();
        assert_eq!(out["a1"].relevance_score, 70.0);
    }

    #[test]
    fn accepts_string_boolean_case_insensitive() {
        let raw = r#"{"a1":{"included":"TRUE","reason":"x","relevance_score":90}}"#;
        let out = normalize(raw).unwrap();
        assert!(out["a1"].included);
    }

    #[test]
    fn clamps_out_of_range_score() {
        let raw = r#"{"a1":{"included":true,"reason":"x","relevance_score":150}}"#;
        let out = normalize(raw).unwrap();
        assert_eq!(out["a1"].relevance_score, 100.0);
    }

    #[test]
    fn defaults_unparsable_score_to_zero() {
        let raw = r#"{"a1":{"included":true,"reason":"x","relevance_score":"not-a-number"}}"#;
        let out = normalize(raw).unwrap();
        // score default 0 forces reconciliation to flip `included` to false
        assert_eq!(out["a1"].relevance_score, 0.0);
        assert!(!out["a1"].included);
    }

    #[test]
    fn missing_field_fails_the_batch() {
        let raw = r#"{"a1":{"included":true,"relevance_score":80}}"#;
        let err = normalize(raw).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField { .. }));
    }

    #[test]
    fn non_object_root_is_invalid_structure() {
        let raw = r#"[1,2,3]"#;
        let err = normalize(raw).unwrap_err();
        assert_eq!(err, NormalizeError::InvalidStructure);
    }

    #[test]
    fn reconciliation_applies_across_the_whole_batch() {
        let raw = r#"{"id7":{"included":true,"reason":"Included: borderline","relevanceScore":"40%"}}"#;
        let out = normalize(raw).unwrap();
        let d = &out["id7"];
        assert!(!d.included);
        assert_eq!(d.relevance_score, 40.0);
        assert_eq!(d.reason, "Excluded: borderline");
    }
}
