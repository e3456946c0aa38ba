//! Append-only evidence store
//!
//! Records are deduplicated by fingerprint. The check and the insert happen
//! under one write lock, so concurrent batches never accept the same record
//! twice, and readers never see a partially inserted record.

use super::{EvidenceKind, EvidenceRecord, Fingerprint};
use crate::ingest::LabelFilter;
use crate::matcher::ReviewReason;
use crate::model::Address;
use crate::CoreResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Matching state of a stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchStatus {
    Pending,
    Matched,
    Unmatched(ReviewReason),
    /// Stored but filtered out by label
    Excluded,
}

/// Result of an insert attempt
#[derive(Debug, Clone)]
pub enum Ingested {
    Accepted(usize, Arc<EvidenceRecord>),
    Duplicate(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub excluded: usize,
    pub pending: usize,
}

#[derive(Default)]
struct StoreInner {
    records: Vec<Arc<EvidenceRecord>>,
    status: Vec<MatchStatus>,
    index: HashMap<Fingerprint, usize>,
}

/// Evidence store shared by all batches of an assessment
#[derive(Default)]
pub struct EvidenceStore {
    inner: RwLock<StoreInner>,
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless its fingerprint is already present.
    ///
    /// `on_accept` runs under the write lock before the record becomes
    /// visible; if it fails nothing is inserted.
    pub fn ingest_with<F>(&self, record: EvidenceRecord, on_accept: F) -> CoreResult<Ingested>
    where
        F: FnOnce(&EvidenceRecord) -> CoreResult<()>,
    {
        let mut inner = self.inner.write();
        if let Some(&index) = inner.index.get(&record.fingerprint) {
            return Ok(Ingested::Duplicate(index));
        }
        on_accept(&record)?;
        let index = inner.records.len();
        let record = Arc::new(record);
        inner.index.insert(record.fingerprint.clone(), index);
        inner.records.push(record.clone());
        inner.status.push(MatchStatus::Pending);
        Ok(Ingested::Accepted(index, record))
    }

    pub fn ingest(&self, record: EvidenceRecord) -> CoreResult<Ingested> {
        self.ingest_with(record, |_| Ok(()))
    }

    pub fn set_status(&self, index: usize, status: MatchStatus) {
        if let Some(slot) = self.inner.write().status.get_mut(index) {
            *slot = status;
        }
    }

    pub fn status(&self, fingerprint: &Fingerprint) -> Option<MatchStatus> {
        let inner = self.inner.read();
        inner
            .index
            .get(fingerprint)
            .and_then(|&i| inner.status.get(i).cloned())
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<EvidenceRecord>> {
        let inner = self.inner.read();
        inner.index.get(fingerprint).map(|&i| inner.records[i].clone())
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.read().index.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in insertion order
    pub fn records(&self) -> Vec<Arc<EvidenceRecord>> {
        self.inner.read().records.clone()
    }

    /// Records retained without a binding, with the reason
    pub fn unmatched(&self) -> Vec<(Arc<EvidenceRecord>, ReviewReason)> {
        let inner = self.inner.read();
        inner
            .records
            .iter()
            .zip(inner.status.iter())
            .filter_map(|(record, status)| match status {
                MatchStatus::Unmatched(reason) => Some((record.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn counts(&self) -> StoreCounts {
        let inner = self.inner.read();
        let mut counts = StoreCounts {
            total: inner.records.len(),
            ..Default::default()
        };
        for status in &inner.status {
            match status {
                MatchStatus::Pending => counts.pending += 1,
                MatchStatus::Matched => counts.matched += 1,
                MatchStatus::Unmatched(_) => counts.unmatched += 1,
                MatchStatus::Excluded => counts.excluded += 1,
            }
        }
        counts
    }

    /// Lazy query over the records present now
    pub fn query(&self, filter: EvidenceFilter) -> EvidenceQuery<'_> {
        let end = self.len();
        EvidenceQuery {
            store: self,
            filter,
            position: 0,
            end,
        }
    }

    fn record_at(&self, index: usize) -> Option<Arc<EvidenceRecord>> {
        self.inner.read().records.get(index).cloned()
    }
}

/// Record selection by kind, label, address and observation time
#[derive(Debug, Clone, Default)]
pub struct EvidenceFilter {
    pub kinds: Option<Vec<EvidenceKind>>,
    pub labels: Option<LabelFilter>,
    pub address: Option<Address>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EvidenceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EvidenceKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn labels(mut self, labels: LabelFilter) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Observation time range, inclusive; records without a time are
    /// excluded once a bound is set
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn matches(&self, record: &EvidenceRecord) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&record.kind()) {
                return false;
            }
        }
        if let Some(labels) = &self.labels {
            if !labels.filter(&record.source.label) {
                return false;
            }
        }
        if let Some(address) = &self.address {
            if !record.addresses().contains(&address) {
                return false;
            }
        }
        if self.since.is_some() || self.until.is_some() {
            let Some(at) = record.observed_at else {
                return false;
            };
            if self.since.map_or(false, |since| at < since) {
                return false;
            }
            if self.until.map_or(false, |until| at > until) {
                return false;
            }
        }
        true
    }
}

/// Finite, restartable iterator over a store snapshot.
///
/// The snapshot bound is fixed when the query is created; records ingested
/// later are not returned, even after a restart.
pub struct EvidenceQuery<'a> {
    store: &'a EvidenceStore,
    filter: EvidenceFilter,
    position: usize,
    end: usize,
}

impl EvidenceQuery<'_> {
    /// Rewind to the first record
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for EvidenceQuery<'_> {
    type Item = Arc<EvidenceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.end {
            let index = self.position;
            self.position += 1;
            if let Some(record) = self.store.record_at(index) {
                if self.filter.matches(&record) {
                    return Some(record);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceBody, EvidenceSource, RawFact, ServiceScan};
    use crate::model::{Endpoint, Transport};
    use crate::CoreError;

    fn raw(key: &str, label: &str) -> EvidenceRecord {
        EvidenceRecord::new(
            EvidenceSource::new("custom", "facts.json", label),
            None,
            EvidenceBody::Raw(RawFact {
                address: None,
                key: key.to_string(),
                value: serde_json::Value::Null,
            }),
        )
        .unwrap()
    }

    fn service(address: &str, port: u16) -> EvidenceRecord {
        EvidenceRecord::new(
            EvidenceSource::new("nmap", "scan.xml", "nmap-01"),
            None,
            EvidenceBody::ServiceScan(ServiceScan {
                endpoint: Endpoint::new(address.parse().unwrap(), Some(port)),
                transport: Transport::Tcp,
                service: None,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_is_noop() {
        let store = EvidenceStore::new();
        assert!(matches!(store.ingest(raw("a", "x")).unwrap(), Ingested::Accepted(0, _)));
        assert!(matches!(store.ingest(raw("a", "y")).unwrap(), Ingested::Duplicate(0)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].source.label, "x");
    }

    #[test]
    fn test_failed_hook_inserts_nothing() {
        let store = EvidenceStore::new();
        let result = store.ingest_with(raw("a", ""), |_| Err(CoreError::Log("disk full".into())));
        assert!(result.is_err());
        assert!(store.is_empty());
        assert!(matches!(store.ingest(raw("a", "")).unwrap(), Ingested::Accepted(..)));
    }

    #[test]
    fn test_query_is_lazy_snapshot_and_restartable() {
        let store = EvidenceStore::new();
        store.ingest(raw("a", "lab")).unwrap();
        store.ingest(service("10.0.0.5", 22)).unwrap();
        store.ingest(service("10.0.0.6", 80)).unwrap();

        let mut query = store.query(EvidenceFilter::all().kind(EvidenceKind::ServiceScan));
        assert_eq!(query.next().unwrap().kind(), EvidenceKind::ServiceScan);

        store.ingest(service("10.0.0.7", 443)).unwrap();
        assert_eq!(query.by_ref().count(), 1);
        query.restart();
        assert_eq!(query.count(), 2);

        let by_address = store
            .query(EvidenceFilter::all().address("10.0.0.7".parse().unwrap()))
            .count();
        assert_eq!(by_address, 1);

        let labelled = store
            .query(EvidenceFilter::all().labels(LabelFilter::parse("lab").unwrap()))
            .count();
        assert_eq!(labelled, 1);
    }

    #[test]
    fn test_counts_follow_status() {
        let store = EvidenceStore::new();
        store.ingest(raw("a", "")).unwrap();
        store.ingest(raw("b", "")).unwrap();
        store.set_status(0, MatchStatus::Matched);
        store.set_status(1, MatchStatus::Unmatched(ReviewReason::UnknownEndpoints));
        let counts = store.counts();
        assert_eq!((counts.total, counts.matched, counts.unmatched), (2, 1, 1));
        assert_eq!(store.unmatched().len(), 1);
    }
}
