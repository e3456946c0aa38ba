//! Append-only assessment log
//!
//! Accepted evidence records, address hints and override operations are
//! appended in the order they take effect. Replaying the entries into a
//! fresh assessment rebuilds the same verdicts.

use super::EvidenceRecord;
use crate::claims::ClaimId;
use crate::ingest::AddressHint;
use crate::model::ElementId;
use crate::verdict::Override;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LogEntry {
    Evidence {
        record: EvidenceRecord,
    },
    AddressHints {
        label: String,
        hints: Vec<AddressHint>,
    },
    OverrideApplied {
        pin: Override,
    },
    OverrideRemoved {
        claim: ClaimId,
        element: ElementId,
        at: DateTime<Utc>,
    },
    Closed {
        at: DateTime<Utc>,
    },
}

/// Destination of log entries
pub trait LogSink: Send + Sync {
    fn append(&self, entry: &LogEntry) -> CoreResult<()>;
}

/// JSON lines file, one entry per line, flushed per entry
pub struct JsonLinesLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesLog {
    /// Open for appending, creating the file if needed
    pub fn open(path: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonLinesLog {
    fn append(&self, entry: &LogEntry) -> CoreResult<()> {
        let line = serde_json::to_string(entry)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| CoreError::Log(format!("{}: {}", self.path.display(), e)))
    }
}

/// In-memory log, mostly for tests and rebuilds
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemoryLog {
    fn append(&self, entry: &LogEntry) -> CoreResult<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Read a JSON lines log.
///
/// A final line that does not parse is treated as a torn write and skipped;
/// a bad line anywhere else is an error.
pub fn read_log(path: &Path) -> CoreResult<Vec<LogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
    let last = lines.iter().rposition(|l| !l.trim().is_empty());

    let mut entries = Vec::with_capacity(lines.len());
    for (number, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if Some(number) == last => {
                warn!("Ignoring torn final log line {} in {}: {}", number + 1, path.display(), e);
            }
            Err(e) => {
                return Err(CoreError::Log(format!(
                    "{} line {}: {}",
                    path.display(),
                    number + 1,
                    e
                )))
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceBody, EvidenceSource, RawFact};
    use std::io::Write as _;

    fn entry(key: &str) -> LogEntry {
        LogEntry::Evidence {
            record: EvidenceRecord::new(
                EvidenceSource::new("custom", "facts.json", "lab"),
                None,
                EvidenceBody::Raw(RawFact {
                    address: None,
                    key: key.to_string(),
                    value: serde_json::json!({"n": 1}),
                }),
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_json_lines_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assessment.log");
        {
            let log = JsonLinesLog::open(&path).unwrap();
            log.append(&entry("a")).unwrap();
            log.append(&LogEntry::Closed { at: Utc::now() }).unwrap();
        }
        // Reopening appends
        JsonLinesLog::open(&path).unwrap().append(&entry("b")).unwrap();

        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], entry("a"));
        assert!(matches!(entries[1], LogEntry::Closed { .. }));
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assessment.log");
        JsonLinesLog::open(&path).unwrap().append(&entry("a")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"entry\":\"evid").unwrap();

        assert_eq!(read_log(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_middle_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assessment.log");
        std::fs::write(&path, "garbage\n").unwrap();
        JsonLinesLog::open(&path).unwrap().append(&entry("a")).unwrap();
        assert!(matches!(read_log(&path), Err(CoreError::Log(_))));
    }

    #[test]
    fn test_memory_log() {
        let log = MemoryLog::new();
        log.append(&entry("a")).unwrap();
        assert_eq!(log.entries(), vec![entry("a")]);
    }
}
