//! Fallacy severity weights and score bands

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Weight for labels that are not in the table
pub const UNKNOWN_FALLACY_WEIGHT: f64 = 0.5;

pub const LOW_BAND_CEILING: f64 = 1.0;
pub const MEDIUM_BAND_CEILING: f64 = 2.5;

const WEIGHTS: &[(&str, f64)] = &[
    ("appeal to fear", 1.2),
    ("straw man", 1.2),
    ("ad hominem", 1.0),
    ("false dilemma", 1.0),
    ("cherry picking", 1.0),
    ("circular reasoning", 0.9),
    ("slippery slope", 0.8),
    ("whataboutism", 0.8),
    ("loaded question", 0.8),
    ("hasty generalization", 0.7),
    ("red herring", 0.7),
    ("bandwagon", 0.6),
    ("appeal to authority", 0.6),
];

fn canonical(label: &str) -> String {
    label
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn fallacy_weight(label: &str) -> f64 {
    let key = canonical(label);
    WEIGHTS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, w)| *w)
        .unwrap_or(UNKNOWN_FALLACY_WEIGHT)
}

/// Sum of weights over distinct labels, compared case-insensitively
pub fn weighted_fallacy_score(fallacies: &[String]) -> f64 {
    let mut seen = HashSet::new();
    let score: f64 = fallacies
        .iter()
        .map(|l| canonical(l))
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.clone()))
        .map(|l| fallacy_weight(&l))
        .sum();
    (score * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityBand {
    None,
    Low,
    Medium,
    High,
}

impl SeverityBand {
    pub fn from_score(score: f64) -> Self {
        if score <= 0.0 {
            SeverityBand::None
        } else if score < LOW_BAND_CEILING {
            SeverityBand::Low
        } else if score < MEDIUM_BAND_CEILING {
            SeverityBand::Medium
        } else {
            SeverityBand::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityBand::None => "none",
            SeverityBand::Low => "low",
            SeverityBand::Medium => "medium",
            SeverityBand::High => "high",
        }
    }
}
