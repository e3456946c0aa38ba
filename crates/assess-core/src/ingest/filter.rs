//! Batch label filter

use crate::{CoreError, CoreResult};
use std::collections::BTreeSet;
use std::fmt;

/// Label filter parsed from a pattern such as `nmap-01,pcap` or
/// `^noisy,^old`.
///
/// If the first entry is an inclusion, only the listed labels pass;
/// otherwise every label passes except the excluded ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    explicit_include: bool,
    included: BTreeSet<String>,
    excluded: BTreeSet<String>,
}

impl Default for LabelFilter {
    fn default() -> Self {
        Self {
            explicit_include: false,
            included: BTreeSet::new(),
            excluded: BTreeSet::new(),
        }
    }
}

impl LabelFilter {
    pub fn parse(pattern: &str) -> CoreResult<Self> {
        let mut filter = Self::default();
        let entries: Vec<&str> = pattern
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect();

        for (i, entry) in entries.iter().enumerate() {
            if let Some(label) = entry.strip_prefix('^') {
                let label = label.trim();
                if label.is_empty() {
                    return Err(CoreError::Config(format!("empty exclusion in '{}'", pattern)));
                }
                filter.excluded.insert(label.to_string());
            } else {
                if i == 0 {
                    filter.explicit_include = true;
                }
                filter.included.insert(entry.to_string());
            }
        }

        if let Some(both) = filter.included.intersection(&filter.excluded).next() {
            return Err(CoreError::Config(format!(
                "label '{}' is both included and excluded",
                both
            )));
        }
        Ok(filter)
    }

    /// Does evidence with this label pass
    pub fn filter(&self, label: &str) -> bool {
        if self.explicit_include {
            self.included.contains(label)
        } else {
            !self.excluded.contains(label)
        }
    }

    /// Is the label named as an inclusion
    pub fn names(&self, label: &str) -> bool {
        self.included.contains(label)
    }

    /// Filter passing every label
    pub fn is_open(&self) -> bool {
        !self.explicit_include && self.excluded.is_empty()
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if self.explicit_include {
            parts.extend(self.included.iter().cloned());
        }
        parts.extend(self.excluded.iter().map(|l| format!("^{}", l)));
        write!(f, "{}", parts.join(","))
    }
}
