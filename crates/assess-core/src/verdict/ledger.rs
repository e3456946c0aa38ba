//! Per-pair verdict ledger
//!
//! Every model element owns a queue of the evidence bound to it and the
//! state of the pairs evaluated on it, behind its own lock. Recording a
//! record re-evaluates only the pairs on that element whose claim kind the
//! record is relevant to; pairs on other elements can be updated
//! concurrently.

use super::{
    Conflict, ElementVerdict, EvidenceRef, EvidenceRole, Override, PairReport, Transition,
    VerdictState,
};
use crate::claims::{resolve_pairs, ClaimEvaluator, ClaimId, ClaimKind, EffectivePair, Evaluation};
use crate::evidence::Fingerprint;
use crate::matcher::MatchedEvidence;
use crate::model::{ElementId, ModelGraph};
use crate::{AssessmentConfig, ConflictPolicy, CoreError, CoreResult, Verdict};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct PairState {
    claim: ClaimId,
    kind: ClaimKind,
    inherited: bool,
    /// State derived from evidence, never `Overridden`
    auto: VerdictState,
    /// Contradiction held for review under `HoldInconclusive`
    held: bool,
    evaluation: Evaluation,
    conflicts: Vec<Conflict>,
    transitions: Vec<Transition>,
    pinned: Option<Override>,
}

impl PairState {
    fn new(claim: ClaimId, kind: ClaimKind, inherited: bool) -> Self {
        Self {
            claim,
            kind,
            inherited,
            auto: VerdictState::Inconclusive,
            held: false,
            evaluation: Evaluation::pending(),
            conflicts: Vec::new(),
            transitions: Vec::new(),
            pinned: None,
        }
    }

    fn state(&self) -> VerdictState {
        match &self.pinned {
            Some(pin) => VerdictState::Overridden(pin.verdict),
            None => self.auto,
        }
    }

    /// Move the automatic state after a re-evaluation
    fn advance(
        &mut self,
        evaluation: Evaluation,
        trigger: Option<&Fingerprint>,
        policy: ConflictPolicy,
    ) -> Option<Transition> {
        let from = self.auto;
        let mut conflict = None;
        let to = if self.held {
            VerdictState::Inconclusive
        } else {
            match (from, evaluation.verdict) {
                (VerdictState::Fail, _) => VerdictState::Fail,
                // Only a pair that already passed can be contradicted
                (VerdictState::Pass, Verdict::Fail) if !evaluation.supporting.is_empty() => {
                    let resolved_to = match policy {
                        ConflictPolicy::ContradictionWins => Verdict::Fail,
                        ConflictPolicy::HoldInconclusive => {
                            self.held = true;
                            Verdict::Inconclusive
                        }
                    };
                    conflict = Some(Conflict {
                        previous: from.verdict(),
                        resolved_to,
                        supporting: evaluation.supporting.clone(),
                        contradicting: evaluation.violating.clone(),
                        policy,
                    });
                    VerdictState::from(resolved_to)
                }
                (_, verdict) => VerdictState::from(verdict),
            }
        };
        let reason = match &conflict {
            Some(_) => format!("conflict: {}", evaluation.explanation),
            None => evaluation.explanation.clone(),
        };
        self.evaluation = evaluation;
        if let Some(conflict) = conflict {
            warn!(
                "Conflict on {}: {} supporting vs {} contradicting record(s), resolved to {}",
                self.kind,
                conflict.supporting.len(),
                conflict.contradicting.len(),
                conflict.resolved_to
            );
            self.conflicts.push(conflict);
        }
        if to == from {
            return None;
        }
        self.auto = to;
        let transition = Transition {
            from,
            to,
            trigger: trigger.cloned(),
            reason,
        };
        self.transitions.push(transition.clone());
        Some(transition)
    }
}

#[derive(Default)]
struct ElementLedger {
    evidence: Vec<MatchedEvidence>,
    pairs: Vec<PairState>,
}

impl ElementLedger {
    fn pair_mut(&mut self, claim: ClaimId) -> Option<&mut PairState> {
        self.pairs.iter_mut().find(|p| p.claim == claim)
    }

    fn report(&self, element: ElementId, pair: &PairState) -> PairReport {
        let mut evidence = Vec::new();
        let roles = [
            (&pair.evaluation.supporting, EvidenceRole::Supporting),
            (&pair.evaluation.violating, EvidenceRole::Violating),
            (&pair.evaluation.doubtful, EvidenceRole::Doubtful),
        ];
        for (fingerprints, role) in roles {
            for fingerprint in fingerprints {
                if let Some(m) = self
                    .evidence
                    .iter()
                    .find(|m| &m.record.fingerprint == fingerprint)
                {
                    evidence.push(EvidenceRef {
                        fingerprint: fingerprint.clone(),
                        kind: m.record.kind(),
                        label: m.record.source.label.clone(),
                        confidence: m.confidence,
                        role,
                    });
                }
            }
        }
        PairReport {
            claim: pair.claim,
            kind: pair.kind.clone(),
            element,
            inherited: pair.inherited,
            state: pair.state(),
            evaluation: pair.evaluation.clone(),
            evidence,
            conflicts: pair.conflicts.clone(),
            transitions: pair.transitions.clone(),
            pinned: pair.pinned.clone(),
        }
    }
}

/// Verdict state of every effective pair of a model
pub struct VerdictLedger {
    model: Arc<ModelGraph>,
    evaluator: ClaimEvaluator,
    policy: ConflictPolicy,
    elements: HashMap<ElementId, Mutex<ElementLedger>>,
}

impl VerdictLedger {
    pub fn new(model: Arc<ModelGraph>, config: &AssessmentConfig) -> Self {
        let mut elements: HashMap<ElementId, ElementLedger> = model
            .elements()
            .map(|e| (e, ElementLedger::default()))
            .collect();
        for pair in resolve_pairs(&model) {
            let Some(claim) = model.claim(pair.claim) else {
                continue;
            };
            if let Some(ledger) = elements.get_mut(&pair.element) {
                ledger
                    .pairs
                    .push(PairState::new(pair.claim, claim.kind.clone(), pair.inherited));
            }
        }
        debug!(
            "Verdict ledger with {} pair(s) over {} element(s)",
            elements.values().map(|l| l.pairs.len()).sum::<usize>(),
            elements.len()
        );
        Self {
            model,
            evaluator: ClaimEvaluator::new(config.low_confidence_threshold),
            policy: config.conflict_policy,
            elements: elements
                .into_iter()
                .map(|(e, l)| (e, Mutex::new(l)))
                .collect(),
        }
    }

    fn element(&self, element: ElementId) -> CoreResult<&Mutex<ElementLedger>> {
        self.elements
            .get(&element)
            .ok_or(CoreError::UnknownElement(element))
    }

    /// Queue a record on an element and re-evaluate the pairs it concerns
    pub fn record(&self, element: ElementId, matched: MatchedEvidence) -> CoreResult<Vec<Transition>> {
        let mut ledger = self.element(element)?.lock();
        let kind = matched.record.kind();
        let trigger = matched.record.fingerprint.clone();
        ledger.evidence.push(matched);

        let ElementLedger { evidence, pairs } = &mut *ledger;
        let mut transitions = Vec::new();
        for pair in pairs.iter_mut().filter(|p| p.kind.is_relevant(kind)) {
            if pair.pinned.is_some() {
                continue;
            }
            let evaluation = self
                .evaluator
                .evaluate(&pair.kind, element, &self.model, evidence);
            if let Some(t) = pair.advance(evaluation, Some(&trigger), self.policy) {
                info!(
                    "{} on {}: {} -> {}",
                    pair.kind,
                    self.model.element_name(element),
                    t.from,
                    t.to
                );
                transitions.push(t);
            }
        }
        Ok(transitions)
    }

    /// Add pairs that became eligible after the ledger was built and
    /// evaluate them on the evidence already queued. Pairs already present
    /// are left alone; returns how many were added.
    pub fn admit(&self, eligible: &[EffectivePair]) -> CoreResult<usize> {
        let mut added = 0;
        for pair in eligible {
            let Some(claim) = self.model.claim(pair.claim) else {
                continue;
            };
            let mut guard = self.element(pair.element)?.lock();
            let ElementLedger { evidence, pairs } = &mut *guard;
            if pairs.iter().any(|p| p.claim == pair.claim) {
                continue;
            }
            let mut state = PairState::new(pair.claim, claim.kind.clone(), pair.inherited);
            let evaluation = self
                .evaluator
                .evaluate(&state.kind, pair.element, &self.model, evidence);
            state.advance(evaluation, None, self.policy);
            debug!(
                "Admitted {} on {}",
                state.kind,
                self.model.element_name(pair.element)
            );
            pairs.push(state);
            added += 1;
        }
        Ok(added)
    }

    /// Pin the verdict of a pair
    pub fn apply_override(&self, pin: Override) -> CoreResult<Transition> {
        let mut ledger = self.element(pin.element)?.lock();
        let pair = ledger.pair_mut(pin.claim).ok_or(CoreError::UnknownPair {
            claim: pin.claim,
            element: pin.element,
        })?;
        let from = pair.state();
        let transition = Transition {
            from,
            to: VerdictState::Overridden(pin.verdict),
            trigger: None,
            reason: format!("override: {}", pin.justification),
        };
        info!(
            "Override on {} {}: {} ({})",
            pin.claim, pin.element, pin.verdict, pin.justification
        );
        pair.pinned = Some(pin);
        pair.transitions.push(transition.clone());
        Ok(transition)
    }

    /// Remove the pin of a pair and recompute it from the evidence so far.
    /// Returns the removed override, `None` when the pair was not pinned.
    pub fn remove_override(&self, claim: ClaimId, element: ElementId) -> CoreResult<Option<Override>> {
        let mut guard = self.element(element)?.lock();
        let ElementLedger { evidence, pairs } = &mut *guard;
        let pair = pairs
            .iter_mut()
            .find(|p| p.claim == claim)
            .ok_or(CoreError::UnknownPair { claim, element })?;
        let Some(pin) = pair.pinned.take() else {
            return Ok(None);
        };
        let from = VerdictState::Overridden(pin.verdict);
        pair.transitions.push(Transition {
            from,
            to: pair.auto,
            trigger: None,
            reason: "override removed".to_string(),
        });
        let evaluation = self
            .evaluator
            .evaluate(&pair.kind, element, &self.model, evidence);
        pair.advance(evaluation, None, self.policy);
        info!("Override removed on {} {}", claim, element);
        Ok(Some(pin))
    }

    /// Current state of a pair
    pub fn state(&self, claim: ClaimId, element: ElementId) -> Option<VerdictState> {
        let ledger = self.elements.get(&element)?.lock();
        ledger.pairs.iter().find(|p| p.claim == claim).map(|p| p.state())
    }

    /// States of all pairs on an element
    pub fn states(&self, element: ElementId) -> Vec<VerdictState> {
        match self.elements.get(&element) {
            Some(ledger) => ledger.lock().pairs.iter().map(|p| p.state()).collect(),
            None => Vec::new(),
        }
    }

    pub fn pair_reports(&self, element: ElementId) -> CoreResult<Vec<PairReport>> {
        let ledger = self.element(element)?.lock();
        Ok(ledger
            .pairs
            .iter()
            .map(|p| ledger.report(element, p))
            .collect())
    }

    /// Weakest link over the element's pairs, and for a node, over the
    /// pairs of its connections too
    pub fn element_verdict(&self, element: ElementId) -> CoreResult<ElementVerdict> {
        let pairs = self.pair_reports(element)?;
        let mut verdicts: Vec<Verdict> = pairs.iter().map(|p| p.verdict()).collect();
        if let ElementId::Node(node) = element {
            for connection in self.model.connections_of(node) {
                verdicts.extend(
                    self.states(ElementId::Connection(connection.id))
                        .iter()
                        .map(|s| s.verdict()),
                );
            }
        }
        Ok(ElementVerdict {
            element,
            name: self.model.element_name(element),
            verdict: Verdict::weakest_link(verdicts),
            pairs,
        })
    }

    /// Number of evidence bindings queued on an element
    pub fn evidence_count(&self, element: ElementId) -> usize {
        self.elements
            .get(&element)
            .map(|l| l.lock().evidence.len())
            .unwrap_or(0)
    }

    pub fn model(&self) -> &Arc<ModelGraph> {
        &self.model
    }
}
