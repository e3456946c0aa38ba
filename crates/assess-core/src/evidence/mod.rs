//! Evidence records
//!
//! An evidence record is an immutable, normalized fact derived from one
//! tool output file. Records are a closed set of tagged variants; facts
//! from tools without a dedicated variant use [`RawFact`].

pub mod log;
pub mod store;

pub use log::{read_log, JsonLinesLog, LogEntry, LogSink, MemoryLog};
pub use store::{EvidenceFilter, EvidenceQuery, EvidenceStore, Ingested, MatchStatus, StoreCounts};

use crate::model::{Address, AppProtocol, Endpoint, TlsVersion, Transport};
use crate::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Schema validation failure of a record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvidenceError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("flow source and destination are the same endpoint {0}")]
    LoopbackFlow(Endpoint),

    #[error("successful handshake carries a failure reason")]
    ContradictoryHandshake,

    #[error("service scan of {0} has no port")]
    MissingPort(Address),

    #[error("fingerprint does not match the record content")]
    FingerprintMismatch,

    #[error("record cannot be encoded: {0}")]
    Encoding(String),
}

/// Content hash identifying a record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tool output a record was derived from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSource {
    /// Tool type, e.g. `nmap` or `testssl`
    pub tool: String,
    /// Originating file name, without directory
    pub file: String,
    /// Batch label used for filtering; not part of the record identity
    #[serde(default)]
    pub label: String,
}

impl EvidenceSource {
    pub fn new(tool: &str, file: &str, label: &str) -> Self {
        let file = std::path::Path::new(file)
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| file.to_string());
        Self {
            tool: tool.to_string(),
            file,
            label: label.to_string(),
        }
    }
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tool, self.file)?;
        if !self.label.is_empty() {
            write!(f, " [{}]", self.label)?;
        }
        Ok(())
    }
}

/// Evidence kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Flow,
    VulnerabilityScan,
    Certificate,
    SoftwareIdentity,
    ServiceScan,
    Raw,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceKind::Flow => write!(f, "flow"),
            EvidenceKind::VulnerabilityScan => write!(f, "vulnerability_scan"),
            EvidenceKind::Certificate => write!(f, "certificate"),
            EvidenceKind::SoftwareIdentity => write!(f, "software_identity"),
            EvidenceKind::ServiceScan => write!(f, "service_scan"),
            EvidenceKind::Raw => write!(f, "raw"),
        }
    }
}

impl std::str::FromStr for EvidenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "flow" => Ok(EvidenceKind::Flow),
            "vulnerability_scan" | "vulnerability" => Ok(EvidenceKind::VulnerabilityScan),
            "certificate" | "cert" => Ok(EvidenceKind::Certificate),
            "software_identity" | "software" => Ok(EvidenceKind::SoftwareIdentity),
            "service_scan" | "service" => Ok(EvidenceKind::ServiceScan),
            "raw" => Ok(EvidenceKind::Raw),
            other => Err(format!("unknown evidence kind '{}'", other)),
        }
    }
}

/// Encryption state observed on a flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowEncryption {
    #[default]
    Unknown,
    Plaintext,
    Handshake {
        succeeded: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<TlsVersion>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<String>,
    },
}

fn default_transport() -> Transport {
    Transport::Tcp
}

/// Observed traffic between two endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowObservation {
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<AppProtocol>,
    #[serde(default)]
    pub encryption: FlowEncryption,
}

/// A single vulnerability finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

/// Vulnerability scan result for one software component; no findings is a
/// clean scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityScan {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default)]
    pub findings: Vec<Vulnerability>,
}

impl VulnerabilityScan {
    pub fn worst(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// TLS auditor facts about a server endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateFact {
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offered_versions: Vec<TlsVersion>,
}

/// Identified software component and version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftwareIdentity {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

/// Open service found by a port scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceScan {
    pub endpoint: Endpoint,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Generic fact from a tool without a dedicated variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Kind-specific record content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceBody {
    Flow(FlowObservation),
    VulnerabilityScan(VulnerabilityScan),
    Certificate(CertificateFact),
    SoftwareIdentity(SoftwareIdentity),
    ServiceScan(ServiceScan),
    Raw(RawFact),
}

impl EvidenceBody {
    pub fn kind(&self) -> EvidenceKind {
        match self {
            EvidenceBody::Flow(_) => EvidenceKind::Flow,
            EvidenceBody::VulnerabilityScan(_) => EvidenceKind::VulnerabilityScan,
            EvidenceBody::Certificate(_) => EvidenceKind::Certificate,
            EvidenceBody::SoftwareIdentity(_) => EvidenceKind::SoftwareIdentity,
            EvidenceBody::ServiceScan(_) => EvidenceKind::ServiceScan,
            EvidenceBody::Raw(_) => EvidenceKind::Raw,
        }
    }
}

/// Immutable evidence record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub fingerprint: Fingerprint,
    pub source: EvidenceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    pub body: EvidenceBody,
}

impl EvidenceRecord {
    /// Create a record, computing its fingerprint from the tool, the file
    /// name, the observation time and the content
    pub fn new(
        source: EvidenceSource,
        observed_at: Option<DateTime<Utc>>,
        body: EvidenceBody,
    ) -> Result<Self, EvidenceError> {
        let fingerprint = Self::compute_fingerprint(&source, observed_at.as_ref(), &body)?;
        Ok(Self {
            fingerprint,
            source,
            observed_at,
            body,
        })
    }

    fn compute_fingerprint(
        source: &EvidenceSource,
        observed_at: Option<&DateTime<Utc>>,
        body: &EvidenceBody,
    ) -> Result<Fingerprint, EvidenceError> {
        let content =
            serde_json::to_vec(body).map_err(|e| EvidenceError::Encoding(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(source.tool.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.file.as_bytes());
        hasher.update([0u8]);
        if let Some(at) = observed_at {
            hasher.update(at.to_rfc3339().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(&content);
        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }

    /// Same record under another batch label
    pub fn with_label(mut self, label: &str) -> Self {
        self.source.label = label.to_string();
        self
    }

    pub fn kind(&self) -> EvidenceKind {
        self.body.kind()
    }

    /// Check the record schema and that the fingerprint matches the content
    pub fn validate(&self) -> Result<(), EvidenceError> {
        if self.source.tool.trim().is_empty() {
            return Err(EvidenceError::MissingField("tool"));
        }
        if self.source.file.trim().is_empty() {
            return Err(EvidenceError::MissingField("file"));
        }
        match &self.body {
            EvidenceBody::Flow(flow) => {
                if flow.source == flow.destination {
                    return Err(EvidenceError::LoopbackFlow(flow.source.clone()));
                }
                if let FlowEncryption::Handshake {
                    succeeded: true,
                    failure: Some(_),
                    ..
                } = flow.encryption
                {
                    return Err(EvidenceError::ContradictoryHandshake);
                }
            }
            EvidenceBody::VulnerabilityScan(scan) => {
                if scan.component.trim().is_empty() {
                    return Err(EvidenceError::MissingField("component"));
                }
                if scan.findings.iter().any(|f| f.id.trim().is_empty()) {
                    return Err(EvidenceError::MissingField("findings.id"));
                }
            }
            EvidenceBody::SoftwareIdentity(sw) => {
                if sw.component.trim().is_empty() {
                    return Err(EvidenceError::MissingField("component"));
                }
            }
            EvidenceBody::ServiceScan(scan) => {
                if scan.endpoint.port.is_none() {
                    return Err(EvidenceError::MissingPort(scan.endpoint.address.clone()));
                }
            }
            EvidenceBody::Raw(raw) => {
                if raw.key.trim().is_empty() {
                    return Err(EvidenceError::MissingField("key"));
                }
            }
            EvidenceBody::Certificate(_) => {}
        }
        let expected =
            Self::compute_fingerprint(&self.source, self.observed_at.as_ref(), &self.body)?;
        if expected != self.fingerprint {
            return Err(EvidenceError::FingerprintMismatch);
        }
        Ok(())
    }

    /// Addresses mentioned by the record
    pub fn addresses(&self) -> Vec<&Address> {
        match &self.body {
            EvidenceBody::Flow(flow) => vec![&flow.source.address, &flow.destination.address],
            EvidenceBody::Certificate(cert) => vec![&cert.endpoint.address],
            EvidenceBody::ServiceScan(scan) => vec![&scan.endpoint.address],
            EvidenceBody::VulnerabilityScan(scan) => scan.address.iter().collect(),
            EvidenceBody::SoftwareIdentity(sw) => sw.address.iter().collect(),
            EvidenceBody::Raw(raw) => raw.address.iter().collect(),
        }
    }

    /// One line description
    pub fn summary(&self) -> String {
        match &self.body {
            EvidenceBody::Flow(flow) => {
                let state = match &flow.encryption {
                    FlowEncryption::Unknown => "unknown".to_string(),
                    FlowEncryption::Plaintext => "plaintext".to_string(),
                    FlowEncryption::Handshake {
                        succeeded: true,
                        version,
                        ..
                    } => match version {
                        Some(v) => format!("handshake {}", v),
                        None => "handshake".to_string(),
                    },
                    FlowEncryption::Handshake {
                        succeeded: false, ..
                    } => "failed handshake".to_string(),
                };
                format!(
                    "flow {} -> {} {} ({})",
                    flow.source, flow.destination, flow.transport, state
                )
            }
            EvidenceBody::VulnerabilityScan(scan) => format!(
                "scan of {} with {} finding(s)",
                scan.component,
                scan.findings.len()
            ),
            EvidenceBody::Certificate(cert) => format!(
                "certificate at {} ({})",
                cert.endpoint,
                if cert.valid { "valid" } else { "invalid" }
            ),
            EvidenceBody::SoftwareIdentity(sw) => match &sw.version {
                Some(v) => format!("software {} {}", sw.component, v),
                None => format!("software {}", sw.component),
            },
            EvidenceBody::ServiceScan(scan) => {
                format!("service {}/{}", scan.endpoint, scan.transport)
            }
            EvidenceBody::Raw(raw) => format!("raw fact {}", raw.key),
        }
    }
}

/// Record as produced by a parser, before the source is attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub body: EvidenceBody,
}

impl EvidenceDraft {
    pub fn into_record(self, source: EvidenceSource) -> Result<EvidenceRecord, EvidenceError> {
        EvidenceRecord::new(source, self.observed_at, self.body)
    }
}
