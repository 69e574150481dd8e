//! Intervention decisions from a Phase 1 analysis and the reader's stored position.
//!
//! Evaluation is deterministic apart from the cooldown, which is the engine's
//! only state: the timestamp of the last emitted non-`none` decision.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::DecisionConfig;
use crate::models::{ContentVector, Phase1Analysis, UserProfile};
use crate::utils::math::{euclidean_distance, round_to};

pub mod severity;

pub use severity::{SeverityBand, weighted_fallacy_score};

/// Distances are compared at this many decimals
pub const DISTANCE_DECIMALS: u32 = 3;

const IDENTICAL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionLevel {
    None,
    Low,
    Medium,
    Critical,
}

impl InterventionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionLevel::None => "none",
            InterventionLevel::Low => "low",
            InterventionLevel::Medium => "medium",
            InterventionLevel::Critical => "critical",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            InterventionLevel::None => "NO_ACTION",
            InterventionLevel::Low => "SHOW_NUDGE",
            InterventionLevel::Medium => "SHOW_COUNTERPOINT",
            InterventionLevel::Critical => "BLOCK_AND_EXPLAIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub echo_chamber_max_distance: f64,
    pub mild_bias_max_distance: f64,
}

impl From<&DecisionConfig> for Thresholds {
    fn from(cfg: &DecisionConfig) -> Self {
        Self {
            echo_chamber_max_distance: cfg.echo_chamber_max_distance,
            mild_bias_max_distance: cfg.mild_bias_max_distance,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&DecisionConfig::default())
    }
}

/// Per-call threshold changes. A negative value disables that band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdOverrides {
    pub echo_chamber_max_distance: Option<f64>,
    pub mild_bias_max_distance: Option<f64>,
}

impl Thresholds {
    pub fn with_overrides(self, overrides: Option<&ThresholdOverrides>) -> Self {
        let Some(o) = overrides else {
            return self;
        };
        Self {
            echo_chamber_max_distance: o
                .echo_chamber_max_distance
                .filter(|v| v.is_finite())
                .unwrap_or(self.echo_chamber_max_distance),
            mild_bias_max_distance: o
                .mild_bias_max_distance
                .filter(|v| v.is_finite())
                .unwrap_or(self.mild_bias_max_distance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownState {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub would_have_triggered_level: Option<InterventionLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLog {
    pub tree: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub level: InterventionLevel,
    pub distance: f64,
    pub weighted_fallacy_score: f64,
    pub severity_band: SeverityBand,
    pub cooldown: CooldownState,
    pub action: String,
    pub log: DecisionLog,
}

/// Level before cooldown is applied, from the exact distance.
/// Only truly identical vectors are critical; the bands compare the distance
/// rounded to three decimals and are inclusive.
pub fn raw_level(distance: f64, has_fallacies: bool, thresholds: &Thresholds) -> InterventionLevel {
    let banded = round_to(distance, DISTANCE_DECIMALS);
    if has_fallacies && distance.abs() < IDENTICAL_EPSILON {
        InterventionLevel::Critical
    } else if has_fallacies && banded <= thresholds.mild_bias_max_distance {
        InterventionLevel::Medium
    } else if !has_fallacies && banded <= thresholds.echo_chamber_max_distance {
        InterventionLevel::Low
    } else {
        InterventionLevel::None
    }
}

fn fmt_vector(v: &ContentVector) -> String {
    format!("({:.2}, {:.2}, {:.2})", v.social, v.economic, v.populist)
}

pub struct DecisionEngine {
    thresholds: Thresholds,
    cooldown_ms: i64,
    last_triggered_at: Mutex<Option<i64>>,
    clock: Arc<dyn Clock>,
}

impl DecisionEngine {
    pub fn new(config: &DecisionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            thresholds: Thresholds::from(config),
            cooldown_ms: config.cooldown_ms.max(0),
            last_triggered_at: Mutex::new(None),
            clock,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn last_triggered_at(&self) -> Option<i64> {
        *self
            .last_triggered_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the cooldown so the next decision is evaluated fresh
    pub fn reset(&self) {
        *self
            .last_triggered_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn evaluate_tweet(
        &self,
        analysis: &Phase1Analysis,
        profile: &UserProfile,
        overrides: Option<&ThresholdOverrides>,
    ) -> Decision {
        let thresholds = self.thresholds.with_overrides(overrides);
        let content = analysis.vector.clamped();
        let user = profile.vector.clamped();

        let exact = euclidean_distance(&content.components(), &user.components());
        let distance = round_to(exact, DISTANCE_DECIMALS);
        let score = weighted_fallacy_score(&analysis.fallacies);
        let band = SeverityBand::from_score(score);
        let has_fallacies = analysis.fallacies.iter().any(|f| !f.trim().is_empty());
        let raw = raw_level(exact, has_fallacies, &thresholds);

        // Read-compare-update under one lock so concurrent evaluations see a single trigger
        let (level, cooldown) = {
            let now = self.clock.now_ms();
            let mut last = self
                .last_triggered_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let cooling = (*last).is_some_and(|t| now - t < self.cooldown_ms);
            if cooling {
                let suppressed = (raw != InterventionLevel::None).then_some(raw);
                (
                    InterventionLevel::None,
                    CooldownState {
                        active: true,
                        would_have_triggered_level: suppressed,
                    },
                )
            } else {
                if raw != InterventionLevel::None {
                    *last = Some(now);
                }
                (
                    raw,
                    CooldownState {
                        active: false,
                        would_have_triggered_level: None,
                    },
                )
            }
        };

        let action = match (cooldown.active, cooldown.would_have_triggered_level) {
            (true, Some(suppressed)) => format!("SKIP_COOLDOWN (suppressed: {})", suppressed.as_str()),
            (true, None) => "SKIP_COOLDOWN".to_string(),
            (false, _) => level.action().to_string(),
        };

        let mut tree = format!(
            "Tweet Detected -> Topic: {} -> Bias Score: {} -> User Bias: {} -> Distance: {:.3} -> Fallacies: {} (score {:.2}, {}) -> Decision: {}",
            analysis.topic,
            fmt_vector(&content),
            fmt_vector(&user),
            distance,
            analysis.fallacies.len(),
            score,
            band.as_str(),
            level.as_str().to_uppercase(),
        );
        if cooldown.active {
            tree.push_str(" -> Cooldown: active");
            if let Some(suppressed) = cooldown.would_have_triggered_level {
                tree.push_str(&format!(" (suppressed {})", suppressed.as_str().to_uppercase()));
            }
        }

        let mut fields = Map::new();
        fields.insert("topic".into(), json!(analysis.topic));
        fields.insert("decision".into(), json!(level.as_str()));
        fields.insert("distance".into(), json!(distance));
        fields.insert("fallacy_count".into(), json!(analysis.fallacies.len()));
        fields.insert("weighted_fallacy_score".into(), json!(score));
        fields.insert("severity_band".into(), json!(band.as_str()));
        fields.insert("cooldown".into(), json!(cooldown.active));
        fields.insert("user_id".into(), json!(profile.user_id));

        if level == InterventionLevel::None {
            debug!(topic = %analysis.topic, distance, cooldown = cooldown.active, "{}", tree);
        } else {
            info!(topic = %analysis.topic, distance, level = level.as_str(), "{}", tree);
        }

        Decision {
            level,
            distance,
            weighted_fallacy_score: score,
            severity_band: band,
            cooldown,
            action,
            log: DecisionLog { tree, fields },
        }
    }
}
