//! Verdict state per (claim, element) pair and its aggregation

pub mod aggregate;
pub mod ledger;

pub use aggregate::{aggregate, ConnectionVerdict, NodeVerdict, SystemVerdict, VerdictCounts};
pub use ledger::VerdictLedger;

use crate::claims::{ClaimId, ClaimKind, Evaluation};
use crate::evidence::{EvidenceKind, Fingerprint};
use crate::model::ElementId;
use crate::{ConflictPolicy, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// State of one (claim, element) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "pinned", rename_all = "snake_case")]
pub enum VerdictState {
    Inconclusive,
    Pass,
    Fail,
    /// Pinned by an assessor override
    Overridden(Verdict),
}

impl VerdictState {
    /// Verdict reported for the pair
    pub fn verdict(&self) -> Verdict {
        match self {
            VerdictState::Inconclusive => Verdict::Inconclusive,
            VerdictState::Pass => Verdict::Pass,
            VerdictState::Fail => Verdict::Fail,
            VerdictState::Overridden(v) => *v,
        }
    }

    pub fn is_overridden(&self) -> bool {
        matches!(self, VerdictState::Overridden(_))
    }
}

impl From<Verdict> for VerdictState {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Pass => VerdictState::Pass,
            Verdict::Fail => VerdictState::Fail,
            Verdict::Inconclusive => VerdictState::Inconclusive,
        }
    }
}

impl fmt::Display for VerdictState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictState::Overridden(v) => write!(f, "{} (overridden)", v),
            other => write!(f, "{}", other.verdict()),
        }
    }
}

/// Assessor annotation pinning the verdict of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub id: Uuid,
    pub claim: ClaimId,
    pub element: ElementId,
    pub verdict: Verdict,
    pub justification: String,
    pub created_at: DateTime<Utc>,
}

impl Override {
    pub fn new(claim: ClaimId, element: ElementId, verdict: Verdict, justification: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            claim,
            element,
            verdict,
            justification: justification.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Evidence in tension on a pair that had passed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub previous: Verdict,
    pub resolved_to: Verdict,
    pub supporting: Vec<Fingerprint>,
    pub contradicting: Vec<Fingerprint>,
    pub policy: ConflictPolicy,
}

/// Recorded state change of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: VerdictState,
    pub to: VerdictState,
    /// Evidence record that caused the change, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Fingerprint>,
    pub reason: String,
}

/// Part a record plays in a pair's evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceRole {
    Supporting,
    Violating,
    /// Violating, but bound with low confidence
    Doubtful,
}

/// Reference from a verdict to the evidence behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub fingerprint: Fingerprint,
    pub kind: EvidenceKind,
    pub label: String,
    pub confidence: f32,
    pub role: EvidenceRole,
}

/// Audit view of one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairReport {
    pub claim: ClaimId,
    pub kind: ClaimKind,
    pub element: ElementId,
    pub inherited: bool,
    pub state: VerdictState,
    pub evaluation: Evaluation,
    pub evidence: Vec<EvidenceRef>,
    pub conflicts: Vec<Conflict>,
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<Override>,
}

impl PairReport {
    pub fn verdict(&self) -> Verdict {
        self.state.verdict()
    }
}

/// Verdict of one element with the pairs evaluated on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementVerdict {
    pub element: ElementId,
    pub name: String,
    /// Weakest link over the element's pairs and, for a node, the pairs of
    /// its connections
    pub verdict: Verdict,
    pub pairs: Vec<PairReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_verdict() {
        assert_eq!(VerdictState::Overridden(Verdict::Pass).verdict(), Verdict::Pass);
        assert_eq!(VerdictState::from(Verdict::Fail), VerdictState::Fail);
        assert_eq!(
            VerdictState::Overridden(Verdict::Pass).to_string(),
            "Pass (overridden)"
        );
    }

    #[test]
    fn test_state_json() {
        let json = serde_json::to_string(&VerdictState::Overridden(Verdict::Fail)).unwrap();
        assert_eq!(json, r#"{"state":"overridden","pinned":"Fail"}"#);
        let back: VerdictState = serde_json::from_str(r#"{"state":"pass"}"#).unwrap();
        assert_eq!(back, VerdictState::Pass);
    }
}
