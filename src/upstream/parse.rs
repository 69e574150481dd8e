//! Strict decoders for upstream model output.
//!
//! Models wrap JSON in prose or code fences, so the outermost `{...}` span is
//! extracted first. Decoding then goes through explicit serde schemas: any
//! missing or wrongly typed field rejects the whole object.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::models::{ContentVector, Phase1Analysis, Phase2Analysis};
use crate::utils::math::clamp_probability;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*(.*?)\s*```$").expect("code fence regex is valid")
});

const DEFAULT_TOPIC: &str = "general";

/// Locate and parse the JSON object embedded in a model reply
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let unfenced = CODE_FENCE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&unfenced[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawVector {
    social: f64,
    economic: f64,
    populist: f64,
}

#[derive(Deserialize)]
struct RawPhase1 {
    vector: RawVector,
    fallacies: Vec<String>,
    topic: String,
    confidence: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPhase2 {
    counter_argument: String,
    logic_failure: String,
    claim: String,
    mechanism: String,
    data_check: String,
    socratic_challenge: String,
}

/// Trimmed, non-empty labels; first spelling wins for case-insensitive duplicates
pub fn normalize_fallacies(labels: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.to_lowercase()))
        .collect()
}

pub fn decode_phase1(raw: &str) -> Option<Phase1Analysis> {
    let value = extract_json_object(raw)?;
    let parsed: RawPhase1 = serde_json::from_value(value).ok()?;
    let topic = parsed.topic.trim();
    Some(Phase1Analysis {
        vector: ContentVector::new(
            parsed.vector.social,
            parsed.vector.economic,
            parsed.vector.populist,
        ),
        fallacies: normalize_fallacies(parsed.fallacies),
        topic: if topic.is_empty() {
            DEFAULT_TOPIC.to_string()
        } else {
            topic.to_string()
        },
        confidence: clamp_probability(parsed.confidence),
    })
}

pub fn decode_phase2(raw: &str) -> Option<Phase2Analysis> {
    let value = extract_json_object(raw)?;
    let parsed: RawPhase2 = serde_json::from_value(value).ok()?;
    let field = |s: String| {
        let t = s.trim();
        (!t.is_empty()).then(|| t.to_string())
    };
    Some(Phase2Analysis {
        counter_argument: field(parsed.counter_argument)?,
        logic_failure: field(parsed.logic_failure)?,
        claim: field(parsed.claim)?,
        mechanism: field(parsed.mechanism)?,
        data_check: field(parsed.data_check)?,
        socratic_challenge: field(parsed.socratic_challenge)?,
    })
}
