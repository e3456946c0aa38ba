//! Batch directory metafile (`00meta.json`)

use super::AddressHint;
use crate::model::Address;
use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub const META_FILE: &str = "00meta.json";

/// Tool output type of a batch directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchFileType {
    /// Normalized evidence records, one JSON object per line
    Evidence,
    Apk,
    Capture,
    CaptureJson,
    Censys,
    Har,
    Mitmproxy,
    Nmap,
    Releases,
    Spdx,
    SshAudit,
    Testssl,
    Vulnerabilities,
    Zap,
}

impl BatchFileType {
    /// Can the core read this type without a tool-specific parser
    pub fn is_normalized(&self) -> bool {
        matches!(self, BatchFileType::Evidence)
    }
}

impl fmt::Display for BatchFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{}", name)
    }
}

fn default_include() -> bool {
    true
}

/// Contents of a batch metafile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMeta {
    pub file_type: BatchFileType,
    /// Batch label, the directory name when absent
    #[serde(default)]
    pub label: Option<String>,
    /// Include the batch when the label filter does not name it
    #[serde(default = "default_include")]
    pub include: bool,
    /// Tool name recorded as evidence source, the file type when absent
    #[serde(default)]
    pub source_name: Option<String>,
    /// Static address to node name hints
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
}

impl BatchMeta {
    pub fn parse(data: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Load the metafile of a batch directory, `None` if there is none
    pub fn load(dir: &Path) -> CoreResult<Option<Self>> {
        let path = dir.join(META_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        let meta = Self::parse(&data).map_err(|e| {
            CoreError::Config(format!("{}: {}", path.display(), e))
        })?;
        Ok(Some(meta))
    }

    /// Label, defaulting to the directory name
    pub fn label_for(&self, dir: &Path) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn tool_name(&self) -> String {
        self.source_name
            .clone()
            .unwrap_or_else(|| self.file_type.to_string())
    }

    /// Parsed address hints
    pub fn address_hints(&self) -> CoreResult<Vec<AddressHint>> {
        self.addresses
            .iter()
            .map(|(address, node)| {
                let address = address.parse::<Address>().map_err(CoreError::Config)?;
                Ok(AddressHint {
                    address,
                    node: node.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let meta = BatchMeta::parse(br#"{"file_type": "nmap"}"#).unwrap();
        assert_eq!(meta.file_type, BatchFileType::Nmap);
        assert!(meta.include);
        assert_eq!(meta.label_for(Path::new("/data/nmap-01")), "nmap-01");
        assert_eq!(meta.tool_name(), "nmap");
        assert!(!meta.file_type.is_normalized());
    }

    #[test]
    fn test_full_metafile() {
        let meta = BatchMeta::parse(
            br#"{"file_type": "evidence", "label": "lab-capture", "include": false,
                 "source_name": "tcpdump",
                 "addresses": {"192.168.4.2": "device", "api.example.com": "backend"}}"#,
        )
        .unwrap();
        assert_eq!(meta.label_for(Path::new("ignored")), "lab-capture");
        assert!(!meta.include);
        assert_eq!(meta.tool_name(), "tcpdump");
        let hints = meta.address_hints().unwrap();
        assert_eq!(hints.len(), 2);
        assert!(hints.iter().any(|h| h.node == "device"));
    }

    #[test]
    fn test_unknown_file_type_is_error() {
        assert!(BatchMeta::parse(br#"{"file_type": "wireshark-xml"}"#).is_err());
        assert_eq!(BatchFileType::SshAudit.to_string(), "ssh-audit");
    }

    #[test]
    fn test_file_type_is_required() {
        assert!(BatchMeta::parse(br#"{"label": "lab"}"#).is_err());
        assert!(BatchMeta::parse(br#"{}"#).is_err());
    }

    #[test]
    fn test_bad_hint_address() {
        let meta = BatchMeta::parse(
            br#"{"file_type": "evidence", "addresses": {"not an address": "x"}}"#,
        )
        .unwrap();
        assert!(matches!(meta.address_hints(), Err(CoreError::Config(_))));
    }
}
