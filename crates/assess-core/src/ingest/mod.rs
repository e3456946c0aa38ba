//! Ingestion boundary types
//!
//! Results and reports of evidence submission, the batch label filter, the
//! batch metafile and the reader for normalized JSON lines evidence.

pub mod filter;
pub mod meta;

pub use filter::LabelFilter;
pub use meta::{BatchFileType, BatchMeta, META_FILE};

use crate::evidence::{EvidenceDraft, EvidenceRecord, EvidenceSource, Fingerprint};
use crate::model::Address;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What happened to an accepted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Bound to at least one model element
    Matched,
    /// Retained without a binding, listed for review
    Unmatched,
    /// Stored but filtered out by label
    Excluded,
}

/// Result of submitting one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestResult {
    Accepted {
        fingerprint: Fingerprint,
        disposition: Disposition,
    },
    Duplicate {
        fingerprint: Fingerprint,
    },
}

impl IngestResult {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestResult::Duplicate { .. })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            IngestResult::Accepted { fingerprint, .. } | IngestResult::Duplicate { fingerprint } => {
                fingerprint
            }
        }
    }
}

/// Static address to node hint from a batch metafile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressHint {
    pub address: Address,
    pub node: String,
}

/// A record or file that could not be ingested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub reason: String,
}

/// Structured result of a batch submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub label: String,
    /// Newly stored records, including unmatched and excluded ones
    pub accepted: usize,
    pub duplicate: usize,
    pub unmatched: usize,
    pub excluded: usize,
    pub rejected: Vec<RejectedRecord>,
    /// Files that could not be read or parsed at all
    pub file_failures: Vec<RejectedRecord>,
    /// The batch was abandoned before all records were submitted
    pub cancelled: bool,
}

impl BatchReport {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn count(&mut self, result: &IngestResult) {
        match result {
            IngestResult::Accepted { disposition, .. } => {
                self.accepted += 1;
                match disposition {
                    Disposition::Unmatched => self.unmatched += 1,
                    Disposition::Excluded => self.excluded += 1,
                    Disposition::Matched => {}
                }
            }
            IngestResult::Duplicate { .. } => self.duplicate += 1,
        }
    }

    /// Fold another report of the same label into this one
    pub fn merge(&mut self, other: BatchReport) {
        self.accepted += other.accepted;
        self.duplicate += other.duplicate;
        self.unmatched += other.unmatched;
        self.excluded += other.excluded;
        self.rejected.extend(other.rejected);
        self.file_failures.extend(other.file_failures);
        self.cancelled |= other.cancelled;
    }

    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.file_failures.is_empty() && !self.cancelled
    }
}

/// Cooperative cancellation flag for in-flight batches
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parse normalized evidence, one JSON object per line.
///
/// Lines that fail to parse are returned as rejections; they never abort the
/// rest of the file.
pub fn parse_evidence_lines(
    data: &str,
    source: &EvidenceSource,
) -> (Vec<EvidenceRecord>, Vec<RejectedRecord>) {
    let mut records = Vec::new();
    let mut rejected = Vec::new();

    for (number, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = serde_json::from_str::<EvidenceDraft>(line)
            .map_err(|e| e.to_string())
            .and_then(|draft| draft.into_record(source.clone()).map_err(|e| e.to_string()));
        match parsed {
            Ok(record) => records.push(record),
            Err(reason) => rejected.push(RejectedRecord {
                file: source.file.clone(),
                line: Some(number + 1),
                reason,
            }),
        }
    }
    (records, rejected)
}
