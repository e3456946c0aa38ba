//! Claim taxonomy and definitions

use crate::evidence::EvidenceKind;
use crate::model::{ElementKind, TlsVersion};
use crate::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Claim kinds with their parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimKind {
    /// Traffic is encrypted with at least the given TLS version
    RequiresEncryption {
        /// Falls back to the connection's declared minimum when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_version: Option<TlsVersion>,
    },
    /// No vulnerability above the given severity in declared software
    NoKnownVulnerabilities { max_severity: Severity },
    /// Only declared connections carry traffic
    NoUnauthorizedFlow,
    /// Only services targeted by declared connections are open
    NoUnexpectedServices,
}

/// Parameterless claim kind, used to compare kinds across scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimTag {
    RequiresEncryption,
    NoKnownVulnerabilities,
    NoUnauthorizedFlow,
    NoUnexpectedServices,
}

impl ClaimTag {
    pub const ALL: [ClaimTag; 4] = [
        ClaimTag::RequiresEncryption,
        ClaimTag::NoKnownVulnerabilities,
        ClaimTag::NoUnauthorizedFlow,
        ClaimTag::NoUnexpectedServices,
    ];

    /// Element types a claim of this kind may be attached to
    pub fn targets(&self) -> &'static [ElementKind] {
        match self {
            ClaimTag::RequiresEncryption => &[ElementKind::System, ElementKind::Connection],
            ClaimTag::NoKnownVulnerabilities => &[ElementKind::System, ElementKind::Node],
            ClaimTag::NoUnauthorizedFlow => &[ElementKind::System],
            ClaimTag::NoUnexpectedServices => &[ElementKind::System, ElementKind::Node],
        }
    }

    /// Element type a System claim of this kind is distributed to,
    /// `None` when it is evaluated on the System itself
    pub fn inherits_to(&self) -> Option<ElementKind> {
        match self {
            ClaimTag::RequiresEncryption => Some(ElementKind::Connection),
            ClaimTag::NoKnownVulnerabilities | ClaimTag::NoUnexpectedServices => {
                Some(ElementKind::Node)
            }
            ClaimTag::NoUnauthorizedFlow => None,
        }
    }

    /// Evidence kinds that may change a verdict of this kind
    pub fn relevant_evidence(&self) -> &'static [EvidenceKind] {
        match self {
            ClaimTag::RequiresEncryption => &[EvidenceKind::Flow, EvidenceKind::Certificate],
            ClaimTag::NoKnownVulnerabilities => &[EvidenceKind::VulnerabilityScan],
            ClaimTag::NoUnauthorizedFlow => &[EvidenceKind::Flow],
            ClaimTag::NoUnexpectedServices => &[EvidenceKind::ServiceScan],
        }
    }
}

impl fmt::Display for ClaimTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimTag::RequiresEncryption => write!(f, "requires_encryption"),
            ClaimTag::NoKnownVulnerabilities => write!(f, "no_known_vulnerabilities"),
            ClaimTag::NoUnauthorizedFlow => write!(f, "no_unauthorized_flow"),
            ClaimTag::NoUnexpectedServices => write!(f, "no_unexpected_services"),
        }
    }
}

impl ClaimKind {
    pub fn tag(&self) -> ClaimTag {
        match self {
            ClaimKind::RequiresEncryption { .. } => ClaimTag::RequiresEncryption,
            ClaimKind::NoKnownVulnerabilities { .. } => ClaimTag::NoKnownVulnerabilities,
            ClaimKind::NoUnauthorizedFlow => ClaimTag::NoUnauthorizedFlow,
            ClaimKind::NoUnexpectedServices => ClaimTag::NoUnexpectedServices,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClaimKind::RequiresEncryption { .. } => "Requires Encryption",
            ClaimKind::NoKnownVulnerabilities { .. } => "No Known Vulnerabilities",
            ClaimKind::NoUnauthorizedFlow => "No Unauthorized Flow",
            ClaimKind::NoUnexpectedServices => "No Unexpected Services",
        }
    }

    pub fn description(&self) -> String {
        match self {
            ClaimKind::RequiresEncryption {
                min_version: Some(v),
            } => format!("Traffic is encrypted with {} or newer", v),
            ClaimKind::RequiresEncryption { min_version: None } => {
                "Traffic is encrypted".to_string()
            }
            ClaimKind::NoKnownVulnerabilities { max_severity } => format!(
                "Declared software has no known vulnerability above {}",
                max_severity
            ),
            ClaimKind::NoUnauthorizedFlow => {
                "Traffic only flows over declared connections".to_string()
            }
            ClaimKind::NoUnexpectedServices => {
                "Only services used by declared connections are reachable".to_string()
            }
        }
    }

    pub fn may_attach(&self, target: ElementKind) -> bool {
        self.tag().targets().contains(&target)
    }

    pub fn is_relevant(&self, kind: EvidenceKind) -> bool {
        self.tag().relevant_evidence().contains(&kind)
    }

    /// Get the requirements for this claim
    pub fn requirements(&self) -> ClaimRequirement {
        let conditions = match self {
            ClaimKind::RequiresEncryption { .. } => vec![
                Condition::SuccessfulHandshake,
                Condition::NoPlaintext,
                Condition::NoFailedHandshake,
                Condition::MinimumTlsVersion,
                Condition::ValidCertificate,
            ],
            ClaimKind::NoKnownVulnerabilities { .. } => {
                vec![Condition::ScanCoverage, Condition::SeverityCeiling]
            }
            ClaimKind::NoUnauthorizedFlow => vec![Condition::DeclaredFlowsOnly],
            ClaimKind::NoUnexpectedServices => vec![Condition::DeclaredServicesOnly],
        };
        ClaimRequirement {
            claim: self.clone(),
            targets: self.tag().targets().to_vec(),
            evidence: self.tag().relevant_evidence().to_vec(),
            conditions,
        }
    }
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKind::RequiresEncryption {
                min_version: Some(v),
            } => write!(f, "{}{{{}}}", self.name(), v),
            ClaimKind::NoKnownVulnerabilities { max_severity } => {
                write!(f, "{}{{{}}}", self.name(), max_severity)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Requirements for a claim to be satisfied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequirement {
    pub claim: ClaimKind,
    pub targets: Vec<ElementKind>,
    pub evidence: Vec<EvidenceKind>,
    pub conditions: Vec<Condition>,
}

/// Specific conditions checked during claim evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    // Encryption
    SuccessfulHandshake,
    NoPlaintext,
    NoFailedHandshake,
    MinimumTlsVersion,
    ValidCertificate,

    // Vulnerabilities
    ScanCoverage,
    SeverityCeiling,

    // Topology
    DeclaredFlowsOnly,
    DeclaredServicesOnly,
}

impl Condition {
    pub fn description(&self) -> &str {
        match self {
            Condition::SuccessfulHandshake => "At least one successful TLS handshake observed",
            Condition::NoPlaintext => "No plaintext traffic observed",
            Condition::NoFailedHandshake => "No failed TLS handshake observed",
            Condition::MinimumTlsVersion => "No protocol version below the minimum",
            Condition::ValidCertificate => "Server certificate is valid and unexpired",
            Condition::ScanCoverage => "Every declared component has been scanned",
            Condition::SeverityCeiling => "No finding above the severity ceiling",
            Condition::DeclaredFlowsOnly => "No flow between nodes without a declared connection",
            Condition::DeclaredServicesOnly => "No open service outside declared connections",
        }
    }
}
