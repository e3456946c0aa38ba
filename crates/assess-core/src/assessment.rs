//! Assessment facade
//!
//! An assessment owns the model, the evidence store, the matcher state and
//! the verdict ledger of one system under assessment. Submission is safe
//! from many threads: the fingerprint check and insert are serialized by
//! the store, matching reads the address book under a shared lock and
//! takes it exclusively only to learn, and each element's pairs are
//! evaluated under that element's own lock.

use crate::claims::{address_pairs, ClaimId};
use crate::evidence::{
    EvidenceBody, EvidenceFilter, EvidenceKind, EvidenceQuery, EvidenceRecord, EvidenceSource,
    EvidenceStore, Fingerprint, Ingested, LogEntry, LogSink, MatchStatus,
};
use crate::ingest::{
    AddressHint, BatchReport, CancelToken, Disposition, IngestResult, LabelFilter, RejectedRecord,
};
use crate::matcher::{AddressBook, MatchOutcome, MatchedEvidence, Matcher, ReviewReason};
use crate::model::{ConnectionId, ElementId, ModelGraph, NodeId, ObservedProtocol};
use crate::report::{LearnedBinding, ObservedConnection, VerdictSnapshot};
use crate::verdict::{aggregate, ElementVerdict, Override, PairReport, SystemVerdict};
use crate::{AssessmentConfig, CoreError, CoreResult, Verdict};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Record retained without a binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedEvidence {
    pub fingerprint: Fingerprint,
    pub kind: EvidenceKind,
    pub source: EvidenceSource,
    pub summary: String,
    pub reason: ReviewReason,
}

/// Entry of the assessor review queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub fingerprint: Fingerprint,
    pub summary: String,
    pub reason: ReviewReason,
    /// Candidate elements of an ambiguous match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

/// A single assessment of one system model
pub struct Assessment {
    id: Uuid,
    model: Arc<ModelGraph>,
    config: AssessmentConfig,
    filter: LabelFilter,
    store: EvidenceStore,
    book: RwLock<AddressBook>,
    matcher: Matcher,
    ledger: crate::verdict::VerdictLedger,
    observed: Mutex<HashMap<ConnectionId, ObservedProtocol>>,
    versions: Mutex<HashMap<NodeId, BTreeMap<String, BTreeSet<String>>>>,
    review: Mutex<Vec<ReviewItem>>,
    log: Option<Arc<dyn LogSink>>,
    /// Non-evidence entries with the store length at the time they applied
    control: Mutex<Vec<(usize, LogEntry)>>,
    epoch: AtomicU64,
    cached: Mutex<Option<Arc<SystemVerdict>>>,
    closed: AtomicBool,
}

impl Assessment {
    /// Create an assessment of a built model
    pub fn new(model: impl Into<Arc<ModelGraph>>, config: AssessmentConfig) -> CoreResult<Self> {
        config.validate()?;
        let model = model.into();
        let filter = LabelFilter::parse(&config.labels)?;
        info!(
            "Assessment of '{}': {} node(s), {} connection(s), {} claim(s)",
            model.name,
            model.nodes().len(),
            model.connections().len(),
            model.claims().len()
        );
        Ok(Self {
            id: Uuid::new_v4(),
            book: RwLock::new(AddressBook::new(&model)),
            matcher: Matcher::new(&config),
            ledger: crate::verdict::VerdictLedger::new(model.clone(), &config),
            model,
            config,
            filter,
            store: EvidenceStore::new(),
            observed: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            review: Mutex::new(Vec::new()),
            log: None,
            control: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            cached: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Append every accepted record and control operation to a log
    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &ModelGraph {
        &self.model
    }

    pub fn config(&self) -> &AssessmentConfig {
        &self.config
    }

    pub fn label_filter(&self) -> &LabelFilter {
        &self.filter
    }

    /// Ingestion epoch, bumped by every change that can move a verdict
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    fn append(&self, entry: &LogEntry) -> CoreResult<()> {
        match &self.log {
            Some(log) => log.append(entry),
            None => Ok(()),
        }
    }

    fn journal_control(&self, entry: LogEntry) {
        let position = self.store.len();
        self.control.lock().push((position, entry));
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    // === Ingestion ===

    /// Submit one record.
    ///
    /// Malformed records are rejected with `MalformedEvidence`; a record
    /// whose fingerprint is already stored is reported as a duplicate and
    /// has no effect.
    pub fn submit_evidence(&self, record: EvidenceRecord) -> CoreResult<IngestResult> {
        self.ensure_open()?;
        if let Err(e) = record.validate() {
            warn!("Rejected record from {}: {}", record.source, e);
            return Err(CoreError::MalformedEvidence {
                file: record.source.file.clone(),
                reason: e.to_string(),
            });
        }
        let fingerprint = record.fingerprint.clone();
        let ingested = self.store.ingest_with(record, |r| {
            self.append(&LogEntry::Evidence { record: r.clone() })
        })?;
        let (index, record) = match ingested {
            Ingested::Duplicate(_) => {
                debug!("Duplicate record {}", fingerprint.short());
                return Ok(IngestResult::Duplicate { fingerprint });
            }
            Ingested::Accepted(index, record) => (index, record),
        };

        let disposition = self.process(index, record)?;
        self.bump();
        Ok(IngestResult::Accepted {
            fingerprint,
            disposition,
        })
    }

    /// Match a stored record and update the verdicts it concerns
    fn process(&self, index: usize, record: Arc<EvidenceRecord>) -> CoreResult<Disposition> {
        if !self.filter.filter(&record.source.label) {
            debug!(
                "Record {} excluded by label '{}'",
                record.fingerprint.short(),
                record.source.label
            );
            self.store.set_status(index, MatchStatus::Excluded);
            return Ok(Disposition::Excluded);
        }

        let outcome = self.match_and_learn(&record);
        self.annotate(&record, &outcome);

        let disposition = match &outcome.unmatched {
            Some(reason) => {
                debug!("Unmatched {}: {}", record.summary(), reason);
                self.store
                    .set_status(index, MatchStatus::Unmatched(reason.clone()));
                self.review.lock().push(ReviewItem {
                    fingerprint: record.fingerprint.clone(),
                    summary: record.summary(),
                    reason: reason.clone(),
                    candidates: self.names(&outcome.ambiguous),
                });
                Disposition::Unmatched
            }
            None => {
                self.store.set_status(index, MatchStatus::Matched);
                if outcome.ambiguous.len() > 1 {
                    self.review.lock().push(ReviewItem {
                        fingerprint: record.fingerprint.clone(),
                        summary: record.summary(),
                        reason: ReviewReason::AmbiguousMatch,
                        candidates: self.names(&outcome.ambiguous),
                    });
                }
                Disposition::Matched
            }
        };

        for binding in outcome.bindings {
            self.ledger.record(
                binding.element,
                MatchedEvidence {
                    record: record.clone(),
                    confidence: binding.confidence,
                    note: binding.note,
                },
            )?;
        }
        Ok(disposition)
    }

    fn match_and_learn(&self, record: &EvidenceRecord) -> MatchOutcome {
        let outcome = {
            let book = self.book.read();
            self.matcher.match_record(record, &self.model, &book)
        };
        if outcome.learned.is_empty() {
            return outcome;
        }
        // Match again under the write lock, another batch may have learned
        // the address in between
        let mut book = self.book.write();
        let outcome = self.matcher.match_record(record, &self.model, &book);
        let mut known = Vec::new();
        for learned in &outcome.learned {
            if book.learn(learned.address.clone(), learned.node) {
                info!(
                    "Learned address {} for {} via {}",
                    learned.address,
                    self.model.element_name(ElementId::Node(learned.node)),
                    self.model.element_name(ElementId::Connection(learned.via))
                );
                known.push(learned.node);
            }
        }
        drop(book);
        for node in known {
            self.admit_node(node);
        }
        outcome
    }

    /// Give a node that just became known by an address the inherited
    /// pairs that need one. Returns whether any pair was added.
    fn admit_node(&self, node: NodeId) -> bool {
        match self.ledger.admit(&address_pairs(&self.model, node)) {
            Ok(added) => added > 0,
            Err(e) => {
                warn!(
                    "Failed to admit pairs on {}: {}",
                    self.model.element_name(ElementId::Node(node)),
                    e
                );
                false
            }
        }
    }

    /// Evidence-derived annotations kept apart from the declared model
    fn annotate(&self, record: &EvidenceRecord, outcome: &MatchOutcome) {
        match &record.body {
            EvidenceBody::Flow(flow) => {
                let mut observed = self.observed.lock();
                for binding in &outcome.bindings {
                    if let ElementId::Connection(id) = binding.element {
                        if binding.confidence >= self.config.low_confidence_threshold {
                            observed.entry(id).or_default().observe(flow);
                        }
                    }
                }
            }
            EvidenceBody::SoftwareIdentity(sw) => {
                let Some(version) = &sw.version else {
                    return;
                };
                let mut versions = self.versions.lock();
                for binding in &outcome.bindings {
                    if let ElementId::Node(id) = binding.element {
                        versions
                            .entry(id)
                            .or_default()
                            .entry(sw.component.to_lowercase())
                            .or_default()
                            .insert(version.clone());
                    }
                }
            }
            _ => {}
        }
    }

    fn names(&self, elements: &[ElementId]) -> Vec<String> {
        elements
            .iter()
            .map(|e| self.model.element_name(*e))
            .collect()
    }

    /// Submit a batch under one label
    pub fn submit_batch(&self, records: Vec<EvidenceRecord>, label: &str) -> CoreResult<BatchReport> {
        self.submit_batch_cancellable(records, label, &CancelToken::new())
    }

    /// Submit a batch that may be abandoned between records.
    ///
    /// Malformed records are collected in the report and never abort the
    /// batch. Records submitted before a cancellation stay ingested.
    pub fn submit_batch_cancellable(
        &self,
        records: Vec<EvidenceRecord>,
        label: &str,
        cancel: &CancelToken,
    ) -> CoreResult<BatchReport> {
        let mut report = BatchReport::new(label);
        for record in records {
            if cancel.is_cancelled() {
                warn!("Batch '{}' cancelled after {} record(s)", label, report.accepted + report.duplicate);
                report.cancelled = true;
                break;
            }
            let record = if label.is_empty() {
                record
            } else {
                record.with_label(label)
            };
            match self.submit_evidence(record) {
                Ok(result) => report.count(&result),
                Err(CoreError::MalformedEvidence { file, reason }) => {
                    report.rejected.push(RejectedRecord {
                        file,
                        line: None,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "Batch '{}': {} accepted, {} duplicate, {} unmatched, {} excluded, {} rejected",
            label,
            report.accepted,
            report.duplicate,
            report.unmatched,
            report.excluded,
            report.rejected.len()
        );
        Ok(report)
    }

    /// Seed static address hints of a batch.
    ///
    /// All node names are checked before anything is seeded. Hints of a
    /// batch excluded by the label filter are logged but not applied.
    pub fn seed_addresses(&self, label: &str, hints: &[AddressHint]) -> CoreResult<usize> {
        self.ensure_open()?;
        let mut resolved = Vec::with_capacity(hints.len());
        for hint in hints {
            let node = self
                .model
                .node_by_name(&hint.node)
                .ok_or_else(|| CoreError::UnknownNode(hint.node.clone()))?;
            resolved.push((hint.address.clone(), node.id));
        }
        let entry = LogEntry::AddressHints {
            label: label.to_string(),
            hints: hints.to_vec(),
        };
        self.append(&entry)?;
        self.journal_control(entry);

        if !self.filter.filter(label) {
            debug!("Address hints of '{}' excluded by label", label);
            return Ok(0);
        }
        let seeded: Vec<NodeId> = {
            let mut book = self.book.write();
            resolved
                .into_iter()
                .filter(|(address, node)| book.seed(address.clone(), *node))
                .map(|(_, node)| node)
                .collect()
        };
        debug!("Seeded {} address(es) from '{}'", seeded.len(), label);
        let mut admitted = false;
        for node in &seeded {
            admitted |= self.admit_node(*node);
        }
        if admitted {
            self.bump();
        }
        Ok(seeded.len())
    }

    // === Overrides ===

    /// Pin the verdict of a (claim, element) pair
    pub fn apply_override(
        &self,
        claim: ClaimId,
        element: ElementId,
        verdict: Verdict,
        justification: &str,
    ) -> CoreResult<Override> {
        self.ensure_open()?;
        if !self.model.contains(element) {
            return Err(CoreError::UnknownElement(element));
        }
        let pin = Override::new(claim, element, verdict, justification);
        self.pin(pin.clone())?;
        Ok(pin)
    }

    fn pin(&self, pin: Override) -> CoreResult<()> {
        if self.ledger.state(pin.claim, pin.element).is_none() {
            return Err(CoreError::UnknownPair {
                claim: pin.claim,
                element: pin.element,
            });
        }
        let entry = LogEntry::OverrideApplied { pin: pin.clone() };
        self.append(&entry)?;
        self.journal_control(entry);
        self.ledger.apply_override(pin)?;
        self.bump();
        Ok(())
    }

    /// Remove the override of a pair; `None` when the pair was not pinned
    pub fn remove_override(&self, claim: ClaimId, element: ElementId) -> CoreResult<Option<Override>> {
        self.ensure_open()?;
        match self.ledger.state(claim, element) {
            None => return Err(CoreError::UnknownPair { claim, element }),
            Some(state) if !state.is_overridden() => return Ok(None),
            Some(_) => {}
        }
        let entry = LogEntry::OverrideRemoved {
            claim,
            element,
            at: Utc::now(),
        };
        self.append(&entry)?;
        self.journal_control(entry);
        let removed = self.ledger.remove_override(claim, element)?;
        self.bump();
        Ok(removed)
    }

    /// Make every verdict terminal; later submissions and overrides fail
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let entry = LogEntry::Closed { at: Utc::now() };
        self.append(&entry)?;
        self.journal_control(entry);
        self.closed.store(true, Ordering::SeqCst);
        info!("Assessment '{}' closed at epoch {}", self.model.name, self.epoch());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // === Queries ===

    /// Verdict of one element with the pairs evaluated on it
    pub fn verdict(&self, element: ElementId) -> CoreResult<ElementVerdict> {
        if !self.model.contains(element) {
            return Err(CoreError::UnknownElement(element));
        }
        self.ledger.element_verdict(element)
    }

    /// Audit view of one pair
    pub fn pair(&self, claim: ClaimId, element: ElementId) -> CoreResult<PairReport> {
        self.ledger
            .pair_reports(element)?
            .into_iter()
            .find(|p| p.claim == claim)
            .ok_or(CoreError::UnknownPair { claim, element })
    }

    /// All pairs of the assessment, system first
    pub fn pairs(&self) -> Vec<PairReport> {
        self.model
            .elements()
            .filter_map(|e| self.ledger.pair_reports(e).ok())
            .flatten()
            .collect()
    }

    /// Aggregated verdicts, computed at most once per epoch
    pub fn system_verdict(&self) -> Arc<SystemVerdict> {
        let epoch = self.epoch();
        let mut cached = self.cached.lock();
        if let Some(verdict) = cached.as_ref() {
            if verdict.epoch == epoch {
                return verdict.clone();
            }
        }
        let verdict = Arc::new(aggregate(&self.ledger, self.store.counts(), epoch));
        *cached = Some(verdict.clone());
        verdict
    }

    pub fn unmatched_evidence(&self) -> Vec<UnmatchedEvidence> {
        self.store
            .unmatched()
            .into_iter()
            .map(|(record, reason)| UnmatchedEvidence {
                fingerprint: record.fingerprint.clone(),
                kind: record.kind(),
                source: record.source.clone(),
                summary: record.summary(),
                reason,
            })
            .collect()
    }

    /// Unmatched records, ambiguous matches and rejected learning attempts
    pub fn review_items(&self) -> Vec<ReviewItem> {
        self.review.lock().clone()
    }

    pub fn query(&self, filter: EvidenceFilter) -> EvidenceQuery<'_> {
        self.store.query(filter)
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    pub fn observed_protocol(&self, connection: ConnectionId) -> Option<ObservedProtocol> {
        self.observed.lock().get(&connection).cloned()
    }

    /// Software versions reported for a node's components
    pub fn observed_versions(&self, node: NodeId) -> BTreeMap<String, BTreeSet<String>> {
        self.versions.lock().get(&node).cloned().unwrap_or_default()
    }

    pub fn learned_addresses(&self) -> Vec<LearnedBinding> {
        self.book
            .read()
            .learned()
            .iter()
            .map(|(address, node)| LearnedBinding {
                address: address.clone(),
                node: *node,
                name: self.model.element_name(ElementId::Node(*node)),
            })
            .collect()
    }

    /// Serializable view of the current verdicts
    pub fn snapshot(&self) -> VerdictSnapshot {
        let mut observed: Vec<ObservedConnection> = self
            .observed
            .lock()
            .iter()
            .map(|(id, observed)| ObservedConnection {
                connection: *id,
                name: self.model.element_name(ElementId::Connection(*id)),
                observed: observed.clone(),
            })
            .collect();
        observed.sort_by_key(|o| o.connection);
        VerdictSnapshot {
            assessment: self.id,
            generated_at: Utc::now(),
            closed: self.is_closed(),
            labels: self.filter.to_string(),
            system: (*self.system_verdict()).clone(),
            pairs: self.pairs(),
            unmatched: self.unmatched_evidence(),
            review: self.review_items(),
            learned: self.learned_addresses(),
            observed,
        }
    }

    // === Replay ===

    /// Rebuild an assessment from log entries
    pub fn replay<I>(
        model: impl Into<Arc<ModelGraph>>,
        config: AssessmentConfig,
        entries: I,
    ) -> CoreResult<Self>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let assessment = Self::new(model, config)?;
        let mut count = 0usize;
        for entry in entries {
            assessment.apply_entry(entry)?;
            count += 1;
        }
        info!("Replayed {} log entries, epoch {}", count, assessment.epoch());
        Ok(assessment)
    }

    fn apply_entry(&self, entry: LogEntry) -> CoreResult<()> {
        match entry {
            LogEntry::Evidence { record } => {
                self.submit_evidence(record)?;
            }
            LogEntry::AddressHints { label, hints } => {
                self.seed_addresses(&label, &hints)?;
            }
            LogEntry::OverrideApplied { pin } => {
                self.ensure_open()?;
                self.pin(pin)?;
            }
            LogEntry::OverrideRemoved { claim, element, .. } => {
                self.remove_override(claim, element)?;
            }
            LogEntry::Closed { .. } => self.close()?,
        }
        Ok(())
    }

    /// Entries that replay this assessment, in the order they took effect
    pub fn journal(&self) -> Vec<LogEntry> {
        let records = self.store.records();
        let control = self.control.lock().clone();
        let mut entries = Vec::with_capacity(records.len() + control.len());
        let mut pending = control.into_iter().peekable();
        for (index, record) in records.into_iter().enumerate() {
            while let Some((_, entry)) = pending.next_if(|(position, _)| *position <= index) {
                entries.push(entry);
            }
            entries.push(LogEntry::Evidence {
                record: (*record).clone(),
            });
        }
        entries.extend(pending.map(|(_, entry)| entry));
        entries
    }

    /// Re-evaluate all stored evidence under another label filter
    pub fn rebuild(&self, labels: &str) -> CoreResult<Self> {
        let config = AssessmentConfig {
            labels: labels.to_string(),
            ..self.config.clone()
        };
        info!("Rebuilding assessment with labels '{}'", labels);
        Self::replay(self.model.clone(), config, self.journal())
    }
}
