//! Claim evaluation engine
//!
//! Evaluation is a pure function of the claim, the element and the evidence
//! matched to that element so far. Each relevant record either supports the
//! claim, violates it, or says nothing about it. Violations from bindings
//! below the confidence threshold are doubtful: they can hold a verdict at
//! `Inconclusive` but never produce `Fail` on their own.

use super::{ClaimKind, Condition, Evaluation, FailedCondition};
use crate::evidence::{
    CertificateFact, EvidenceBody, FlowEncryption, FlowObservation, ServiceScan,
    VulnerabilityScan,
};
use crate::matcher::{MatchNote, MatchedEvidence};
use crate::model::{ElementId, ModelGraph, TlsVersion};
use crate::{Severity, Verdict};
use std::collections::BTreeSet;

/// What a single record says about a claim
enum Judgement {
    Supports,
    Violates(Condition, String),
    Neutral,
}

/// Claim evaluator
#[derive(Debug, Clone)]
pub struct ClaimEvaluator {
    threshold: f32,
}

impl ClaimEvaluator {
    pub fn new(low_confidence_threshold: f32) -> Self {
        Self {
            threshold: low_confidence_threshold,
        }
    }

    pub fn is_confident(&self, confidence: f32) -> bool {
        confidence >= self.threshold
    }

    /// Evaluate a claim kind on one element
    pub fn evaluate(
        &self,
        claim: &ClaimKind,
        element: ElementId,
        model: &ModelGraph,
        evidence: &[MatchedEvidence],
    ) -> Evaluation {
        let mut supporting = Vec::new();
        let mut violating = Vec::new();
        let mut doubtful = Vec::new();
        let mut failing_conditions: Vec<FailedCondition> = Vec::new();
        let mut scanned: BTreeSet<String> = BTreeSet::new();

        for matched in evidence
            .iter()
            .filter(|m| claim.is_relevant(m.record.kind()))
        {
            let confident = self.is_confident(matched.confidence);
            let fingerprint = matched.record.fingerprint.clone();
            match self.judge(claim, element, model, matched) {
                Judgement::Supports => {
                    if confident {
                        if let EvidenceBody::VulnerabilityScan(scan) = &matched.record.body {
                            scanned.insert(scan.component.to_lowercase());
                        }
                        if !supporting.contains(&fingerprint) {
                            supporting.push(fingerprint);
                        }
                    }
                }
                Judgement::Violates(condition, description) => {
                    if !confident {
                        if !doubtful.contains(&fingerprint) {
                            doubtful.push(fingerprint);
                        }
                        continue;
                    }
                    if let EvidenceBody::VulnerabilityScan(scan) = &matched.record.body {
                        scanned.insert(scan.component.to_lowercase());
                    }
                    if !violating.contains(&fingerprint) {
                        violating.push(fingerprint.clone());
                    }
                    match failing_conditions
                        .iter_mut()
                        .find(|f| f.condition_type == condition)
                    {
                        Some(failed) => {
                            if !failed.evidence.contains(&fingerprint) {
                                failed.evidence.push(fingerprint);
                            }
                        }
                        None => failing_conditions.push(FailedCondition {
                            condition_type: condition,
                            description,
                            evidence: vec![fingerprint],
                        }),
                    }
                }
                Judgement::Neutral => {}
            }
        }

        let (satisfied, missing) = self.coverage(claim, element, model, &supporting, &scanned);

        let verdict = if !violating.is_empty() {
            Verdict::Fail
        } else if !doubtful.is_empty() {
            Verdict::Inconclusive
        } else if satisfied {
            Verdict::Pass
        } else {
            Verdict::Inconclusive
        };

        let explanation = match verdict {
            Verdict::Pass => format!(
                "Claim '{}' holds: {} supporting observation(s).",
                claim.name(),
                supporting.len()
            ),
            Verdict::Fail => format!(
                "Claim '{}' is VIOLATED: {} of {} conditions failed.",
                claim.name(),
                failing_conditions.len(),
                claim.requirements().conditions.len()
            ),
            Verdict::Inconclusive if !doubtful.is_empty() => format!(
                "Claim '{}' is held inconclusive by {} low-confidence violation(s).",
                claim.name(),
                doubtful.len()
            ),
            Verdict::Inconclusive => match missing {
                Some(missing) => format!("Claim '{}' lacks evidence: {}.", claim.name(), missing),
                None => format!("Claim '{}' lacks evidence.", claim.name()),
            },
        };

        Evaluation {
            verdict,
            supporting,
            violating,
            doubtful,
            failing_conditions,
            explanation,
        }
    }

    /// Judge one record
    fn judge(
        &self,
        claim: &ClaimKind,
        element: ElementId,
        model: &ModelGraph,
        matched: &MatchedEvidence,
    ) -> Judgement {
        match (claim, &matched.record.body) {
            (ClaimKind::RequiresEncryption { min_version }, EvidenceBody::Flow(flow)) => {
                let min = min_version.or_else(|| declared_min_tls(element, model));
                judge_encrypted_flow(flow, min)
            }
            (ClaimKind::RequiresEncryption { min_version }, EvidenceBody::Certificate(cert)) => {
                let min = min_version.or_else(|| declared_min_tls(element, model));
                judge_certificate(cert, min, matched.record.observed_at)
            }
            (
                ClaimKind::NoKnownVulnerabilities { max_severity },
                EvidenceBody::VulnerabilityScan(scan),
            ) => judge_scan(scan, *max_severity),
            (ClaimKind::NoUnauthorizedFlow, EvidenceBody::Flow(flow)) => match matched.note {
                MatchNote::UnauthorizedPair { source, target } => Judgement::Violates(
                    Condition::DeclaredFlowsOnly,
                    format!(
                        "Flow {} -> {} between {} and {} has no declared connection",
                        flow.source,
                        flow.destination,
                        model.element_name(ElementId::Node(source)),
                        model.element_name(ElementId::Node(target)),
                    ),
                ),
                MatchNote::Authorized => Judgement::Supports,
                MatchNote::Direct | MatchNote::Reply => Judgement::Neutral,
            },
            (ClaimKind::NoUnexpectedServices, EvidenceBody::ServiceScan(scan)) => {
                judge_service(scan, element, model)
            }
            _ => Judgement::Neutral,
        }
    }

    /// Has enough supporting evidence been seen to pass, and if not, what is
    /// missing
    fn coverage(
        &self,
        claim: &ClaimKind,
        element: ElementId,
        model: &ModelGraph,
        supporting: &[crate::evidence::Fingerprint],
        scanned: &BTreeSet<String>,
    ) -> (bool, Option<String>) {
        match claim {
            ClaimKind::NoKnownVulnerabilities { .. } => {
                let declared: Vec<String> = match element {
                    ElementId::Node(id) => model
                        .node(id)
                        .map(|n| n.software.iter().map(|c| c.name.clone()).collect())
                        .unwrap_or_default(),
                    ElementId::System | ElementId::Connection(_) => Vec::new(),
                };
                if declared.is_empty() {
                    return (false, Some("no declared software components".to_string()));
                }
                let missing: Vec<String> = declared
                    .into_iter()
                    .filter(|name| !scanned.contains(&name.to_lowercase()))
                    .collect();
                if missing.is_empty() {
                    (true, None)
                } else {
                    (false, Some(format!("no scan for {}", missing.join(", "))))
                }
            }
            ClaimKind::RequiresEncryption { .. } => (
                !supporting.is_empty(),
                Some("no successful handshake observed".to_string()),
            ),
            ClaimKind::NoUnauthorizedFlow => (
                !supporting.is_empty(),
                Some("no traffic observed".to_string()),
            ),
            ClaimKind::NoUnexpectedServices => (
                !supporting.is_empty(),
                Some("no service scan".to_string()),
            ),
        }
    }
}

impl Default for ClaimEvaluator {
    fn default() -> Self {
        Self::new(crate::AssessmentConfig::default().low_confidence_threshold)
    }
}

fn declared_min_tls(element: ElementId, model: &ModelGraph) -> Option<TlsVersion> {
    match element {
        ElementId::Connection(id) => model.connection(id).and_then(|c| c.protocol.min_tls),
        _ => None,
    }
}

fn judge_encrypted_flow(flow: &FlowObservation, min: Option<TlsVersion>) -> Judgement {
    match &flow.encryption {
        FlowEncryption::Plaintext => Judgement::Violates(
            Condition::NoPlaintext,
            format!("Plaintext flow {} -> {}", flow.source, flow.destination),
        ),
        FlowEncryption::Handshake {
            succeeded: false,
            failure,
            ..
        } => Judgement::Violates(
            Condition::NoFailedHandshake,
            format!(
                "Failed handshake {} -> {}{}",
                flow.source,
                flow.destination,
                failure
                    .as_ref()
                    .map(|f| format!(": {}", f))
                    .unwrap_or_default()
            ),
        ),
        FlowEncryption::Handshake {
            succeeded: true,
            version: Some(version),
            ..
        } => match min {
            Some(min) if *version < min => Judgement::Violates(
                Condition::MinimumTlsVersion,
                format!("Negotiated {} below required {}", version, min),
            ),
            _ => Judgement::Supports,
        },
        FlowEncryption::Handshake {
            succeeded: true,
            version: None,
            ..
        } => {
            if min.is_none() {
                Judgement::Supports
            } else {
                Judgement::Neutral
            }
        }
        FlowEncryption::Unknown => match &flow.application {
            Some(app) if app.default_port().is_some() && !app.is_encrypted() => {
                Judgement::Violates(
                    Condition::NoPlaintext,
                    format!(
                        "Cleartext {} flow {} -> {}",
                        app, flow.source, flow.destination
                    ),
                )
            }
            _ => Judgement::Neutral,
        },
    }
}

fn judge_certificate(
    cert: &CertificateFact,
    min: Option<TlsVersion>,
    observed_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Judgement {
    if !cert.valid {
        return Judgement::Violates(
            Condition::ValidCertificate,
            format!("Invalid certificate at {}", cert.endpoint),
        );
    }
    if let (Some(not_after), Some(at)) = (cert.not_after, observed_at) {
        if not_after < at {
            return Judgement::Violates(
                Condition::ValidCertificate,
                format!("Certificate at {} expired {}", cert.endpoint, not_after),
            );
        }
    }
    if let Some(min) = min {
        if let Some(weak) = cert.offered_versions.iter().filter(|v| **v < min).min() {
            return Judgement::Violates(
                Condition::MinimumTlsVersion,
                format!("{} offers {} below required {}", cert.endpoint, weak, min),
            );
        }
    }
    Judgement::Neutral
}

fn judge_scan(scan: &VulnerabilityScan, max: Severity) -> Judgement {
    let over: Vec<String> = scan
        .findings
        .iter()
        .filter(|f| f.severity > max)
        .map(|f| format!("{} ({})", f.id, f.severity))
        .collect();
    if over.is_empty() {
        Judgement::Supports
    } else {
        Judgement::Violates(
            Condition::SeverityCeiling,
            format!(
                "{} has findings above {}: {}",
                scan.component,
                max,
                over.join(", ")
            ),
        )
    }
}

fn judge_service(scan: &ServiceScan, element: ElementId, model: &ModelGraph) -> Judgement {
    let ElementId::Node(node) = element else {
        return Judgement::Neutral;
    };
    let Some(port) = scan.endpoint.port else {
        return Judgement::Neutral;
    };
    let expected = model.connections_of(node).any(|c| {
        c.servers().contains(&node)
            && c.protocol.effective_port() == Some(port)
            && c.protocol.transport.accepts(scan.transport)
    });
    if expected {
        Judgement::Supports
    } else {
        Judgement::Violates(
            Condition::DeclaredServicesOnly,
            format!(
                "Unexpected service {}/{} on {}",
                scan.endpoint,
                scan.transport,
                model.element_name(element)
            ),
        )
    }
}
