use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Midpoint score used for fail-open assessments.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Stable key of a content item, derived from its primary resource locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Returns `None` for blank locators.
    pub fn new(locator: &str) -> Option<Self> {
        let trimmed = locator.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short digest for log lines, so full resource URLs stay out of logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an assessment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentSource {
    Remote,
    /// Produced locally after a failed classification call.
    Fallback,
}

/// Output of classifying one item. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub identity: Identity,
    pub ai_score: f64,
    pub misinfo_score: f64,
    pub source: AssessmentSource,
}

impl Assessment {
    pub fn remote(identity: Identity, ai_score: f64, misinfo_score: f64) -> Self {
        Self {
            identity,
            ai_score,
            misinfo_score,
            source: AssessmentSource::Remote,
        }
    }

    /// Fail-open assessment: both scores at the midpoint, never concealed.
    pub fn fallback(identity: Identity) -> Self {
        Self {
            identity,
            ai_score: NEUTRAL_SCORE,
            misinfo_score: NEUTRAL_SCORE,
            source: AssessmentSource::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == AssessmentSource::Fallback
    }
}

/// Concealment thresholds, both on a 0..=1 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub ai_threshold: f64,
    pub misinfo_threshold: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            ai_threshold: 0.7,
            misinfo_threshold: 0.5,
        }
    }
}

impl Policy {
    pub fn new(ai_threshold: f64, misinfo_threshold: f64) -> Self {
        Self {
            ai_threshold,
            misinfo_threshold,
        }
    }

    pub fn is_valid(&self) -> bool {
        valid_unit(self.ai_threshold) && valid_unit(self.misinfo_threshold)
    }
}

pub fn valid_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub identity: Identity,
    pub should_conceal: bool,
}

/// Inclusive on both thresholds: a score equal to its threshold conceals.
/// Fallback assessments never conceal.
pub fn decide(assessment: &Assessment, policy: &Policy) -> Decision {
    let should_conceal = !assessment.is_fallback()
        && (assessment.ai_score >= policy.ai_threshold
            || assessment.misinfo_score >= policy.misinfo_threshold);
    Decision {
        identity: assessment.identity.clone(),
        should_conceal,
    }
}

/// Process-lifetime assessment cache. Entries are never evicted.
#[derive(Debug, Default)]
pub struct DecisionCache {
    entries: HashMap<Identity, Assessment>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &Identity) -> Option<&Assessment> {
        self.entries.get(identity)
    }

    /// First write wins. Returns false if an assessment was already cached.
    pub fn put(&mut self, assessment: Assessment) -> bool {
        if self.entries.contains_key(&assessment.identity) {
            return false;
        }
        self.entries.insert(assessment.identity.clone(), assessment);
        true
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn decide(&self, identity: &Identity, policy: &Policy) -> Option<Decision> {
        self.get(identity).map(|a| decide(a, policy))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
