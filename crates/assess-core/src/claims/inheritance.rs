//! System claim inheritance
//!
//! A claim on the System applies to every eligible element of the type its
//! kind inherits to, unless that element carries its own claim of the same
//! kind. Kinds that do not inherit are evaluated on the System itself.
//! A node that only becomes addressable during ingestion is admitted to its
//! address-gated pairs at that point, see [`address_pairs`].

use super::{ClaimId, ClaimTag};
use crate::model::{ElementId, ElementKind, ModelGraph, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A claim and the element it is evaluated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectivePair {
    pub claim: ClaimId,
    pub element: ElementId,
    /// Pair derived from a System claim
    pub inherited: bool,
}

/// All claim/element pairs evaluated for the model, local claims first
pub fn resolve_pairs(model: &ModelGraph) -> Vec<EffectivePair> {
    let mut pairs = Vec::new();
    let mut local: HashSet<(ElementId, ClaimTag)> = HashSet::new();

    for claim in model.claims() {
        if claim.target == ElementId::System {
            continue;
        }
        local.insert((claim.target, claim.kind.tag()));
        pairs.push(EffectivePair {
            claim: claim.id,
            element: claim.target,
            inherited: false,
        });
    }

    for claim in model.claims() {
        if claim.target != ElementId::System {
            continue;
        }
        let tag = claim.kind.tag();
        let Some(kind) = tag.inherits_to() else {
            pairs.push(EffectivePair {
                claim: claim.id,
                element: ElementId::System,
                inherited: false,
            });
            continue;
        };
        for element in eligible(model, tag, kind) {
            if local.contains(&(element, tag)) {
                continue;
            }
            pairs.push(EffectivePair {
                claim: claim.id,
                element,
                inherited: true,
            });
        }
    }
    pairs
}

/// Elements a System claim of the tag is distributed to
fn eligible(model: &ModelGraph, tag: ClaimTag, kind: ElementKind) -> Vec<ElementId> {
    match kind {
        ElementKind::Connection => model
            .connections()
            .iter()
            .map(|c| ElementId::Connection(c.id))
            .collect(),
        ElementKind::Node => model
            .nodes()
            .iter()
            .filter(|n| match tag {
                ClaimTag::NoKnownVulnerabilities => !n.software.is_empty(),
                ClaimTag::NoUnexpectedServices => {
                    !n.addresses.is_empty() || is_server(model, n.id)
                }
                _ => true,
            })
            .map(|n| ElementId::Node(n.id))
            .collect(),
        ElementKind::System => vec![ElementId::System],
    }
}

/// Inherited pairs a node becomes eligible for once it is known by an
/// address, including one seeded or learned after the model was built
pub fn address_pairs(model: &ModelGraph, node: NodeId) -> Vec<EffectivePair> {
    let local = |tag: ClaimTag| {
        model
            .claims()
            .iter()
            .any(|c| c.target == ElementId::Node(node) && c.kind.tag() == tag)
    };
    model
        .claims()
        .iter()
        .filter(|c| c.target == ElementId::System)
        .filter(|c| c.kind.tag() == ClaimTag::NoUnexpectedServices && !local(c.kind.tag()))
        .map(|c| EffectivePair {
            claim: c.id,
            element: ElementId::Node(node),
            inherited: true,
        })
        .collect()
}

fn is_server(model: &ModelGraph, node: NodeId) -> bool {
    model
        .connections_of(node)
        .any(|c| c.servers().contains(&node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ClaimKind;
    use crate::model::{ModelBuilder, NodeKind, Protocol, SoftwareComponent, TlsVersion};
    use crate::Severity;

    #[test]
    fn test_system_claim_distributes_to_connections() {
        let mut b = ModelBuilder::new("home");
        let device = b.add_node("device", NodeKind::Device).unwrap();
        let backend = b.add_node("backend", NodeKind::Backend).unwrap();
        let phone = b.add_node("phone", NodeKind::Mobile).unwrap();
        let c1 = b.add_connection(device, backend, Protocol::tls(443)).unwrap();
        let c2 = b.add_connection(phone, backend, Protocol::tls(443)).unwrap();
        let system = b
            .add_claim(
                ClaimKind::RequiresEncryption {
                    min_version: Some(TlsVersion::Tls12),
                },
                ElementId::System,
            )
            .unwrap();
        let local = b
            .add_claim(
                ClaimKind::RequiresEncryption {
                    min_version: Some(TlsVersion::Tls13),
                },
                c2,
            )
            .unwrap();
        let model = b.build().unwrap();

        let pairs = resolve_pairs(&model);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&EffectivePair {
            claim: system,
            element: ElementId::Connection(c1.id()),
            inherited: true,
        }));
        // The local claim shadows the inherited one
        assert!(pairs.contains(&EffectivePair {
            claim: local,
            element: ElementId::Connection(c2.id()),
            inherited: false,
        }));
    }

    #[test]
    fn test_node_eligibility() {
        let mut b = ModelBuilder::new("home");
        let device = b.add_node("device", NodeKind::Device).unwrap();
        let backend = b.add_node("backend", NodeKind::Backend).unwrap();
        b.add_node("printer", NodeKind::Generic).unwrap();
        b.add_software(device, SoftwareComponent::new("openssl", Some("3.0.8")))
            .unwrap();
        b.add_connection(device, backend, Protocol::tls(443)).unwrap();
        b.add_claim(
            ClaimKind::NoKnownVulnerabilities {
                max_severity: Severity::Medium,
            },
            ElementId::System,
        )
        .unwrap();
        b.add_claim(ClaimKind::NoUnexpectedServices, ElementId::System)
            .unwrap();
        b.add_claim(ClaimKind::NoUnauthorizedFlow, ElementId::System)
            .unwrap();
        let model = b.build().unwrap();

        let pairs = resolve_pairs(&model);
        let on = |element: ElementId| {
            pairs
                .iter()
                .filter(|p| p.element == element)
                .count()
        };
        // vulnerabilities only where software is declared, services only on servers
        assert_eq!(on(ElementId::Node(device.id())), 1);
        assert_eq!(on(ElementId::Node(backend.id())), 1);
        assert_eq!(on(ElementId::System), 1);
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn test_address_pairs_for_client_node() {
        let mut b = ModelBuilder::new("home");
        let device = b.add_node("device", NodeKind::Device).unwrap();
        let backend = b.add_node("backend", NodeKind::Backend).unwrap();
        b.add_connection(device, backend, Protocol::tls(443)).unwrap();
        let services = b
            .add_claim(ClaimKind::NoUnexpectedServices, ElementId::System)
            .unwrap();
        b.add_claim(ClaimKind::NoUnauthorizedFlow, ElementId::System)
            .unwrap();
        let model = b.build().unwrap();

        // The device is a client without declared addresses
        assert!(!resolve_pairs(&model)
            .iter()
            .any(|p| p.element == ElementId::Node(device.id())));
        assert_eq!(
            address_pairs(&model, device.id()),
            vec![EffectivePair {
                claim: services,
                element: ElementId::Node(device.id()),
                inherited: true,
            }]
        );
    }

    #[test]
    fn test_no_claims_no_pairs() {
        let mut b = ModelBuilder::new("empty");
        b.add_node("device", NodeKind::Device).unwrap();
        assert!(resolve_pairs(&b.build().unwrap()).is_empty());
    }
}
