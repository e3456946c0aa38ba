//! Evidence to model element matching
//!
//! Binds each record to the elements it is evidence about, with a
//! confidence in `0.0..=1.0`. Addresses resolve by exact match against the
//! address book; an address seen for the first time on a flow may be
//! learned when exactly one node can be reached from the known endpoint
//! over a declared connection.

pub mod address_book;

pub use address_book::{AddressBook, AddressOrigin};

use crate::evidence::{
    CertificateFact, EvidenceBody, EvidenceRecord, FlowObservation, RawFact, ServiceScan,
};
use crate::model::{
    Address, AppProtocol, ConnectionId, ElementId, ModelGraph, NodeId, Protocol,
};
use crate::AssessmentConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How a record relates to the element it is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum MatchNote {
    /// Plain binding
    Direct,
    /// Flow answered by the server of a declared connection
    Reply,
    /// System view of a flow carried by a declared connection
    Authorized,
    /// System view of a flow between known nodes outside any declared
    /// connection
    UnauthorizedPair { source: NodeId, target: NodeId },
}

/// One element a record is bound to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub element: ElementId,
    pub confidence: f32,
    pub note: MatchNote,
}

/// Record as seen by the evaluator of one element
#[derive(Debug, Clone)]
pub struct MatchedEvidence {
    pub record: Arc<EvidenceRecord>,
    pub confidence: f32,
    pub note: MatchNote,
}

/// Why a record needs an assessor's attention
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    /// No endpoint address is known
    UnknownEndpoints,
    /// Endpoints resolve to nodes, but no declared connection carries it
    NoDeclaredConnection,
    /// An address resolves to, or could be learned for, several nodes
    AmbiguousAddress,
    /// No declared connection leads to a node for an unknown address
    NoCandidateNode,
    /// Bound to several candidate elements with reduced confidence
    AmbiguousMatch,
    /// No node declares the software component
    UnknownComponent,
    /// The address resolves to no node
    NoNodeAtAddress,
}

impl fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReviewReason::UnknownEndpoints => "no endpoint address is known",
            ReviewReason::NoDeclaredConnection => "no declared connection matches",
            ReviewReason::AmbiguousAddress => "address is ambiguous",
            ReviewReason::NoCandidateNode => "no node can be reached for the unknown address",
            ReviewReason::AmbiguousMatch => "several candidate elements",
            ReviewReason::UnknownComponent => "no node declares the component",
            ReviewReason::NoNodeAtAddress => "no node has the address",
        };
        write!(f, "{}", text)
    }
}

/// Address learned while matching a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedAddress {
    pub address: Address,
    pub node: NodeId,
    pub via: ConnectionId,
}

/// Everything the matcher found out about one record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub bindings: Vec<Binding>,
    pub learned: Vec<LearnedAddress>,
    /// Set when the record stays unmatched
    pub unmatched: Option<ReviewReason>,
    /// Candidates of an ambiguous match or learning attempt
    pub ambiguous: Vec<ElementId>,
}

impl MatchOutcome {
    fn unmatched(reason: ReviewReason) -> Self {
        Self {
            unmatched: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_matched(&self) -> bool {
        self.unmatched.is_none() && !self.bindings.is_empty()
    }
}

struct Candidate {
    connection: ConnectionId,
    specificity: u8,
    confidence: f32,
    reply: bool,
}

/// Which flow endpoint is unknown
#[derive(Clone, Copy, PartialEq)]
enum Unknown {
    Source,
    Destination,
}

/// Stateless matcher; learned state lives in the address book
#[derive(Debug, Clone)]
pub struct Matcher {
    learning: bool,
    learned_confidence: f32,
}

impl Matcher {
    pub fn new(config: &AssessmentConfig) -> Self {
        Self {
            learning: config.address_learning,
            learned_confidence: config.learned_confidence,
        }
    }

    /// Match one record against the model
    pub fn match_record(
        &self,
        record: &EvidenceRecord,
        model: &ModelGraph,
        book: &AddressBook,
    ) -> MatchOutcome {
        match &record.body {
            EvidenceBody::Flow(flow) => self.match_flow(flow, model, book),
            EvidenceBody::VulnerabilityScan(scan) => self.match_component(
                &scan.component,
                scan.version.as_deref(),
                scan.address.as_ref(),
                model,
                book,
            ),
            EvidenceBody::SoftwareIdentity(sw) => self.match_component(
                &sw.component,
                sw.version.as_deref(),
                sw.address.as_ref(),
                model,
                book,
            ),
            EvidenceBody::Certificate(cert) => self.match_certificate(cert, model, book),
            EvidenceBody::ServiceScan(scan) => self.match_service(scan, book),
            EvidenceBody::Raw(raw) => self.match_raw(raw, book),
        }
    }

    fn origin_confidence(&self, origin: AddressOrigin) -> f32 {
        match origin {
            AddressOrigin::Learned => self.learned_confidence,
            AddressOrigin::Declared | AddressOrigin::Seeded => 1.0,
        }
    }

    fn match_flow(
        &self,
        flow: &FlowObservation,
        model: &ModelGraph,
        book: &AddressBook,
    ) -> MatchOutcome {
        let src = book.resolve(&flow.source.address);
        let dst = book.resolve(&flow.destination.address);
        match (src.is_empty(), dst.is_empty()) {
            (false, false) => self.bind_flow(flow, model, src, dst),
            (true, true) => MatchOutcome::unmatched(ReviewReason::UnknownEndpoints),
            _ if !self.learning => MatchOutcome::unmatched(ReviewReason::UnknownEndpoints),
            (false, true) => self.learn_flow(flow, model, src, Unknown::Destination),
            (true, false) => self.learn_flow(flow, model, dst, Unknown::Source),
        }
    }

    fn bind_flow(
        &self,
        flow: &FlowObservation,
        model: &ModelGraph,
        src: &[(NodeId, AddressOrigin)],
        dst: &[(NodeId, AddressOrigin)],
    ) -> MatchOutcome {
        let mut pairs: Vec<(NodeId, NodeId, f32)> = Vec::new();
        let mut found: Vec<Candidate> = Vec::new();

        for &(s, s_origin) in src {
            for &(d, d_origin) in dst {
                if s == d {
                    continue;
                }
                let confidence = self
                    .origin_confidence(s_origin)
                    .min(self.origin_confidence(d_origin));
                pairs.push((s, d, confidence));
                found.extend(flow_candidates(flow, model, s, d, confidence));
            }
        }

        if pairs.is_empty() {
            return MatchOutcome::unmatched(ReviewReason::NoDeclaredConnection);
        }

        if found.is_empty() {
            let n = pairs.len() as f32;
            let bindings = pairs
                .iter()
                .map(|&(source, target, confidence)| Binding {
                    element: ElementId::System,
                    confidence: confidence / n,
                    note: MatchNote::UnauthorizedPair { source, target },
                })
                .collect();
            return MatchOutcome {
                bindings,
                unmatched: Some(ReviewReason::NoDeclaredConnection),
                ..Default::default()
            };
        }

        let best = found.iter().map(|c| c.specificity).max().unwrap_or(0);
        let mut kept: Vec<Candidate> = Vec::new();
        for candidate in found.into_iter().filter(|c| c.specificity == best) {
            if !kept.iter().any(|k| k.connection == candidate.connection) {
                kept.push(candidate);
            }
        }

        let n = kept.len() as f32;
        let mut bindings: Vec<Binding> = kept
            .iter()
            .map(|c| Binding {
                element: ElementId::Connection(c.connection),
                confidence: c.confidence / n,
                note: if c.reply {
                    MatchNote::Reply
                } else {
                    MatchNote::Direct
                },
            })
            .collect();
        let system_confidence = bindings
            .iter()
            .map(|b| b.confidence)
            .fold(0.0f32, f32::max);
        bindings.push(Binding {
            element: ElementId::System,
            confidence: system_confidence,
            note: MatchNote::Authorized,
        });

        let ambiguous = if kept.len() > 1 {
            kept.iter()
                .map(|c| ElementId::Connection(c.connection))
                .collect()
        } else {
            Vec::new()
        };

        MatchOutcome {
            bindings,
            ambiguous,
            ..Default::default()
        }
    }

    fn learn_flow(
        &self,
        flow: &FlowObservation,
        model: &ModelGraph,
        known: &[(NodeId, AddressOrigin)],
        unknown: Unknown,
    ) -> MatchOutcome {
        let [(node, origin)] = known else {
            return MatchOutcome {
                unmatched: Some(ReviewReason::AmbiguousAddress),
                ambiguous: known.iter().map(|(n, _)| ElementId::Node(*n)).collect(),
                ..Default::default()
            };
        };
        let node = *node;

        let mut reachable: Vec<(NodeId, ConnectionId)> = Vec::new();
        for conn in model.connections_of(node) {
            if !conn.protocol.transport.accepts(flow.transport) {
                continue;
            }
            let other = if conn.source == node {
                conn.target
            } else {
                conn.source
            };
            let (s, d) = match unknown {
                Unknown::Destination => (node, other),
                Unknown::Source => (other, node),
            };
            if conn.orientation(s, d).is_some()
                && port_specificity(&conn.protocol, flow.destination.port).is_some()
                && !reachable.iter().any(|(n, _)| *n == other)
            {
                reachable.push((other, conn.id));
            }
        }

        match reachable.as_slice() {
            [] => MatchOutcome::unmatched(ReviewReason::NoCandidateNode),
            [(other, via)] => {
                let learned = LearnedAddress {
                    address: match unknown {
                        Unknown::Source => flow.source.address.clone(),
                        Unknown::Destination => flow.destination.address.clone(),
                    },
                    node: *other,
                    via: *via,
                };
                let fresh = [(*other, AddressOrigin::Learned)];
                let known = [(node, *origin)];
                let mut outcome = match unknown {
                    Unknown::Source => self.bind_flow(flow, model, &fresh, &known),
                    Unknown::Destination => self.bind_flow(flow, model, &known, &fresh),
                };
                outcome.learned.push(learned);
                outcome
            }
            several => MatchOutcome {
                unmatched: Some(ReviewReason::AmbiguousAddress),
                ambiguous: several.iter().map(|(n, _)| ElementId::Node(*n)).collect(),
                ..Default::default()
            },
        }
    }

    fn match_component(
        &self,
        name: &str,
        version: Option<&str>,
        address: Option<&Address>,
        model: &ModelGraph,
        book: &AddressBook,
    ) -> MatchOutcome {
        let mut candidates: Vec<NodeId> = model
            .nodes()
            .iter()
            .filter(|n| n.component(name).is_some())
            .map(|n| n.id)
            .collect();
        if candidates.is_empty() {
            return MatchOutcome::unmatched(ReviewReason::UnknownComponent);
        }

        if let Some(address) = address {
            let at = book.resolve(address);
            let narrowed: Vec<NodeId> = candidates
                .iter()
                .copied()
                .filter(|c| at.iter().any(|(n, _)| n == c))
                .collect();
            if !narrowed.is_empty() {
                candidates = narrowed;
            }
        }

        if candidates.len() > 1 {
            if let Some(version) = version {
                let narrowed: Vec<NodeId> = candidates
                    .iter()
                    .copied()
                    .filter(|&c| {
                        model
                            .node(c)
                            .and_then(|n| n.component(name))
                            .and_then(|sw| sw.version.as_deref())
                            == Some(version)
                    })
                    .collect();
                if !narrowed.is_empty() {
                    candidates = narrowed;
                }
            }
        }

        spread(candidates.into_iter().map(ElementId::Node).collect(), 1.0)
    }

    fn match_certificate(
        &self,
        cert: &CertificateFact,
        model: &ModelGraph,
        book: &AddressBook,
    ) -> MatchOutcome {
        let nodes = book.resolve(&cert.endpoint.address);
        if nodes.is_empty() {
            return MatchOutcome::unmatched(ReviewReason::NoNodeAtAddress);
        }
        let share = nodes.len() as f32;

        let mut bindings = Vec::new();
        for &(node, origin) in nodes {
            for conn in model.connections() {
                if !conn.servers().contains(&node) || is_cleartext(&conn.protocol.application) {
                    continue;
                }
                if port_specificity(&conn.protocol, cert.endpoint.port).is_none() {
                    continue;
                }
                bindings.push(Binding {
                    element: ElementId::Connection(conn.id),
                    confidence: self.origin_confidence(origin) / share,
                    note: MatchNote::Direct,
                });
            }
        }
        if bindings.is_empty() {
            return MatchOutcome::unmatched(ReviewReason::NoDeclaredConnection);
        }
        let ambiguous = if nodes.len() > 1 {
            nodes.iter().map(|(n, _)| ElementId::Node(*n)).collect()
        } else {
            Vec::new()
        };
        MatchOutcome {
            bindings,
            ambiguous,
            ..Default::default()
        }
    }

    fn match_service(&self, scan: &ServiceScan, book: &AddressBook) -> MatchOutcome {
        self.match_address(&scan.endpoint.address, book)
    }

    fn match_raw(&self, raw: &RawFact, book: &AddressBook) -> MatchOutcome {
        match &raw.address {
            Some(address) => self.match_address(address, book),
            None => MatchOutcome {
                bindings: vec![Binding {
                    element: ElementId::System,
                    confidence: 1.0,
                    note: MatchNote::Direct,
                }],
                ..Default::default()
            },
        }
    }

    fn match_address(&self, address: &Address, book: &AddressBook) -> MatchOutcome {
        let nodes = book.resolve(address);
        if nodes.is_empty() {
            return MatchOutcome::unmatched(ReviewReason::NoNodeAtAddress);
        }
        let share = nodes.len() as f32;
        let bindings = nodes
            .iter()
            .map(|&(node, origin)| Binding {
                element: ElementId::Node(node),
                confidence: self.origin_confidence(origin) / share,
                note: MatchNote::Direct,
            })
            .collect();
        let ambiguous = if nodes.len() > 1 {
            nodes.iter().map(|(n, _)| ElementId::Node(*n)).collect()
        } else {
            Vec::new()
        };
        MatchOutcome {
            bindings,
            ambiguous,
            ..Default::default()
        }
    }
}

/// Bind to every candidate with the confidence split between them
fn spread(candidates: Vec<ElementId>, confidence: f32) -> MatchOutcome {
    let share = candidates.len().max(1) as f32;
    let bindings = candidates
        .iter()
        .map(|&element| Binding {
            element,
            confidence: confidence / share,
            note: MatchNote::Direct,
        })
        .collect();
    let ambiguous = if candidates.len() > 1 {
        candidates
    } else {
        Vec::new()
    };
    MatchOutcome {
        bindings,
        ambiguous,
        ..Default::default()
    }
}

fn is_cleartext(application: &AppProtocol) -> bool {
    matches!(
        application,
        AppProtocol::Http | AppProtocol::Dns | AppProtocol::Mqtt | AppProtocol::Ntp
    )
}

/// How precisely a port matches a declared protocol: 2 for an explicitly
/// declared port, 1 for a well-known default port, 0 when either side does
/// not say; `None` on mismatch
fn port_specificity(protocol: &Protocol, port: Option<u16>) -> Option<u8> {
    match (protocol.effective_port(), port) {
        (None, _) | (Some(_), None) => Some(0),
        (Some(declared), Some(seen)) if declared == seen => {
            Some(if protocol.port.is_some() { 2 } else { 1 })
        }
        _ => None,
    }
}

/// Connections able to carry a flow from `s` to `d`, as a request or as a
/// reply from the connection's server
fn flow_candidates(
    flow: &FlowObservation,
    model: &ModelGraph,
    s: NodeId,
    d: NodeId,
    confidence: f32,
) -> Vec<Candidate> {
    let mut found = Vec::new();
    for conn in model.connections() {
        if !conn.protocol.transport.accepts(flow.transport) {
            continue;
        }
        if conn.orientation(s, d).is_some() {
            if let Some(specificity) = port_specificity(&conn.protocol, flow.destination.port) {
                found.push(Candidate {
                    connection: conn.id,
                    specificity,
                    confidence,
                    reply: false,
                });
            }
        } else if conn.orientation(d, s).is_some() {
            let port = conn.protocol.effective_port();
            if port.is_some() && port == flow.source.port {
                if let Some(specificity) = port_specificity(&conn.protocol, flow.source.port) {
                    found.push(Candidate {
                        connection: conn.id,
                        specificity,
                        confidence,
                        reply: true,
                    });
                }
            }
        }
    }
    found
}
