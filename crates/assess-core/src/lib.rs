//! System Assessment Core Engine
//!
//! This crate matches evidence collected by third-party security tools
//! against a structural model of a system (nodes, connections, claims)
//! and derives auditable per-claim, per-node and system verdicts.

pub mod assessment;
pub mod claims;
pub mod evidence;
pub mod ingest;
pub mod matcher;
pub mod model;
pub mod report;
pub mod verdict;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use assessment::{Assessment, ReviewItem, UnmatchedEvidence};
pub use claims::{Claim, ClaimId, ClaimKind};
pub use evidence::{EvidenceBody, EvidenceRecord, EvidenceSource, Fingerprint};
pub use ingest::{BatchReport, IngestResult, LabelFilter};
pub use model::{ConnectionId, ElementId, ModelBuilder, ModelGraph, NodeId, NodeKind};
pub use verdict::{Override, SystemVerdict, VerdictState};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model construction error: {0}")]
    Build(#[from] model::BuildError),

    #[error("Malformed evidence from {file}: {reason}")]
    MalformedEvidence { file: String, reason: String },

    #[error("Unknown element: {0}")]
    UnknownElement(ElementId),

    #[error("Claim {claim} is not evaluated on {element}")]
    UnknownPair { claim: ClaimId, element: ElementId },

    #[error("Unknown node name: {0}")]
    UnknownNode(String),

    #[error("Assessment is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Evidence log error: {0}")]
    Log(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Verdict of a claim, element or the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Verdict::Fail)
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Verdict::Inconclusive)
    }

    /// Weakest-link combination: any `Fail` wins, then any `Inconclusive`,
    /// `Pass` only when every input passes. No inputs is `Inconclusive`.
    pub fn weakest_link<I>(verdicts: I) -> Verdict
    where
        I: IntoIterator<Item = Verdict>,
    {
        let mut seen = false;
        let mut inconclusive = false;
        for v in verdicts {
            seen = true;
            match v {
                Verdict::Fail => return Verdict::Fail,
                Verdict::Inconclusive => inconclusive = true,
                Verdict::Pass => {}
            }
        }
        if !seen || inconclusive {
            Verdict::Inconclusive
        } else {
            Verdict::Pass
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "Pass"),
            Verdict::Fail => write!(f, "Fail"),
            Verdict::Inconclusive => write!(f, "Inconclusive"),
        }
    }
}

/// Severity levels for vulnerability findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a CVSS base score to a severity band
    pub fn from_cvss(score: f32) -> Self {
        match score {
            s if s >= 9.0 => Severity::Critical,
            s if s >= 7.0 => Severity::High,
            s if s >= 4.0 => Severity::Medium,
            s if s > 0.0 => Severity::Low,
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "Info"),
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" | "none" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" | "moderate" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(CoreError::Config(format!("unknown severity '{}'", other))),
        }
    }
}

/// How a prior `Pass` reacts to directly contradicting evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Contradicting evidence moves the pair to `Fail`, recorded as a conflict
    #[default]
    ContradictionWins,
    /// Contradicting evidence moves the pair to `Inconclusive` pending review
    HoldInconclusive,
}

/// Assessment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessmentConfig {
    /// Conflict resolution for `Pass` pairs receiving contradicting evidence
    pub conflict_policy: ConflictPolicy,
    /// Attach unknown addresses to nodes reachable over a declared connection
    pub address_learning: bool,
    /// Confidence of bindings resolved through learned addresses
    pub learned_confidence: f32,
    /// Bindings below this confidence cannot produce `Fail`
    pub low_confidence_threshold: f32,
    /// Label filter pattern, e.g. `nmap-01,pcap` or `^noisy`
    pub labels: String,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            address_learning: true,
            learned_confidence: 0.8,
            low_confidence_threshold: 0.75,
            labels: String::new(),
        }
    }
}

impl AssessmentConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &std::path::Path) -> CoreResult<Self> {
        let data = std::fs::read(path)?;
        let config: AssessmentConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        for (name, value) in [
            ("learned_confidence", self.learned_confidence),
            ("low_confidence_threshold", self.low_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::Config(format!(
                    "{} must be within 0.0..=1.0, got {}",
                    name, value
                )));
            }
        }
        LabelFilter::parse(&self.labels)?;
        Ok(())
    }
}
