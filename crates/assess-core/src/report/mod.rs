//! Derived verdict snapshot
//!
//! The snapshot is the serializable view of an assessment at one epoch. It
//! is derived state only: the evidence log stays the source of truth and a
//! replay of the log rebuilds it.

pub mod json;

use crate::assessment::{ReviewItem, UnmatchedEvidence};
use crate::model::{Address, ConnectionId, NodeId, ObservedProtocol};
use crate::verdict::{PairReport, SystemVerdict};
use crate::CoreResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Address attached to a node from evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedBinding {
    pub address: Address,
    pub node: NodeId,
    pub name: String,
}

/// Observed protocol annotation of a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedConnection {
    pub connection: ConnectionId,
    pub name: String,
    pub observed: ObservedProtocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictSnapshot {
    pub assessment: Uuid,
    pub generated_at: DateTime<Utc>,
    pub closed: bool,
    pub labels: String,
    pub system: SystemVerdict,
    pub pairs: Vec<PairReport>,
    pub unmatched: Vec<UnmatchedEvidence>,
    pub review: Vec<ReviewItem>,
    pub learned: Vec<LearnedBinding>,
    pub observed: Vec<ObservedConnection>,
}

impl VerdictSnapshot {
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        std::fs::write(path, json::generate(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let data = std::fs::read_to_string(path)?;
        json::parse(&data)
    }
}
