//! Claims and their evaluation

pub mod engine;
pub mod inheritance;
pub mod taxonomy;

pub use engine::ClaimEvaluator;
pub use inheritance::{address_pairs, resolve_pairs, EffectivePair};
pub use taxonomy::{ClaimKind, ClaimRequirement, ClaimTag, Condition};

use crate::evidence::Fingerprint;
use crate::model::ElementId;
use crate::Verdict;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable claim index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClaimId(pub(crate) u32);

impl ClaimId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "claim#{}", self.0)
    }
}

/// A declared security requirement attached to one model element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub kind: ClaimKind,
    pub target: ElementId,
}

/// A condition that failed during claim evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCondition {
    pub condition_type: Condition,
    pub description: String,
    pub evidence: Vec<Fingerprint>,
}

/// Outcome of evaluating one claim on one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Confident evidence satisfying the claim
    pub supporting: Vec<Fingerprint>,
    /// Confident evidence violating the claim
    pub violating: Vec<Fingerprint>,
    /// Low-confidence evidence violating the claim
    pub doubtful: Vec<Fingerprint>,
    pub failing_conditions: Vec<FailedCondition>,
    pub explanation: String,
}

impl Evaluation {
    /// Evaluation of a pair with no evidence yet
    pub fn pending() -> Self {
        Self {
            verdict: Verdict::Inconclusive,
            supporting: Vec::new(),
            violating: Vec::new(),
            doubtful: Vec::new(),
            failing_conditions: Vec::new(),
            explanation: "No evidence".to_string(),
        }
    }
}
