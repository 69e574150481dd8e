//! Analysis data model shared by the cache, upstream adapters and decision engine

use serde::{Deserialize, Serialize};

use crate::utils::math::clamp_unit;

/// Point in the fixed 3-axis ideological space. Components are always in [-1, 1];
/// deserialization clamps through [`ContentVector::new`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "WireVector")]
pub struct ContentVector {
    pub social: f64,
    pub economic: f64,
    pub populist: f64,
}

#[derive(Deserialize)]
struct WireVector {
    social: f64,
    economic: f64,
    populist: f64,
}

impl From<WireVector> for ContentVector {
    fn from(w: WireVector) -> Self {
        Self::new(w.social, w.economic, w.populist)
    }
}

impl ContentVector {
    /// Build a vector, clamping every component into [-1, 1]
    pub fn new(social: f64, economic: f64, populist: f64) -> Self {
        Self {
            social: clamp_unit(social),
            economic: clamp_unit(economic),
            populist: clamp_unit(populist),
        }
    }

    /// Re-clamp a vector that may have been built from untrusted input
    pub fn clamped(self) -> Self {
        Self::new(self.social, self.economic, self.populist)
    }

    pub fn components(&self) -> [f64; 3] {
        [self.social, self.economic, self.populist]
    }
}

/// Content-level analysis; independent of the viewer, so it is cached globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase1Analysis {
    pub vector: ContentVector,
    pub fallacies: Vec<String>,
    pub topic: String,
    pub confidence: f64,
}

/// Per-user deep dive; may be produced with the user's own upstream key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase2Analysis {
    pub counter_argument: String,
    pub logic_failure: String,
    pub claim: String,
    pub mechanism: String,
    pub data_check: String,
    pub socratic_challenge: String,
}

/// Stored viewer position consumed by the decision engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub vector: ContentVector,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, vector: ContentVector) -> Self {
        Self {
            user_id: user_id.into(),
            vector: vector.clamped(),
        }
    }
}

/// Extra inputs handed to an upstream analyzer alongside the text
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    /// Phase 1 result the deep dive should build on
    pub phase1: Option<Phase1Analysis>,
    pub user_vector: Option<ContentVector>,
    /// Caller-supplied upstream credential (BYOK)
    pub api_key: Option<String>,
}

impl AnalysisContext {
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }
}
