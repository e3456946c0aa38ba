//! Model construction
//!
//! Every call returns opaque references consumed by later calls. Any
//! structural problem aborts construction: a malformed model cannot be
//! evaluated safely.

use super::{
    Address, Connection, ConnectionId, Direction, ElementId, ElementKind, ModelGraph, Node,
    NodeId, NodeKind, Protocol, SoftwareComponent,
};
use crate::claims::{Claim, ClaimId, ClaimKind};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("claim {claim} cannot be attached to a {target}")]
    ClaimTargetMismatch { claim: String, target: ElementKind },

    #[error("{target} already declares a {claim} claim")]
    DuplicateClaim { claim: String, target: String },

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("connection from '{0}' to itself")]
    SelfConnection(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid model description: {0}")]
    Invalid(String),
}

/// Opaque reference to a node under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(NodeId);

/// Opaque reference to a connection under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionRef(ConnectionId);

impl NodeRef {
    pub fn id(&self) -> NodeId {
        self.0
    }
}

impl ConnectionRef {
    pub fn id(&self) -> ConnectionId {
        self.0
    }
}

impl From<NodeRef> for ElementId {
    fn from(r: NodeRef) -> Self {
        ElementId::Node(r.0)
    }
}

impl From<ConnectionRef> for ElementId {
    fn from(r: ConnectionRef) -> Self {
        ElementId::Connection(r.0)
    }
}

/// Incremental model builder
pub struct ModelBuilder {
    name: String,
    nodes: Vec<Node>,
    connections: Vec<Connection>,
    claims: Vec<Claim>,
}

impl ModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: Vec::new(),
            connections: Vec::new(),
            claims: Vec::new(),
        }
    }

    /// Add a node with a unique name
    pub fn add_node(&mut self, name: &str, kind: NodeKind) -> Result<NodeRef, BuildError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BuildError::Invalid("node name must not be empty".to_string()));
        }
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(BuildError::DuplicateNode(name.to_string()));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            kind,
            addresses: BTreeSet::new(),
            software: Vec::new(),
        });
        Ok(NodeRef(id))
    }

    /// Declare an address of a node
    pub fn add_address(&mut self, node: NodeRef, address: Address) -> Result<(), BuildError> {
        self.node_mut(node)?.addresses.insert(address);
        Ok(())
    }

    /// Parse and declare an address of a node
    pub fn add_address_str(&mut self, node: NodeRef, address: &str) -> Result<(), BuildError> {
        let address = address.parse::<Address>().map_err(BuildError::InvalidAddress)?;
        self.add_address(node, address)
    }

    /// Declare a software component of a node
    pub fn add_software(
        &mut self,
        node: NodeRef,
        component: SoftwareComponent,
    ) -> Result<(), BuildError> {
        let node = self.node_mut(node)?;
        if component.name.trim().is_empty() {
            return Err(BuildError::Invalid(format!(
                "empty software component name on '{}'",
                node.name
            )));
        }
        if node.component(&component.name).is_none() {
            node.software.push(component);
        }
        Ok(())
    }

    /// Add a directed connection
    pub fn add_connection(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        protocol: Protocol,
    ) -> Result<ConnectionRef, BuildError> {
        self.connect(source, target, protocol, Direction::Directed)
    }

    /// Add a connection either end may open
    pub fn add_bidirectional_connection(
        &mut self,
        a: NodeRef,
        b: NodeRef,
        protocol: Protocol,
    ) -> Result<ConnectionRef, BuildError> {
        self.connect(a, b, protocol, Direction::Bidirectional)
    }

    fn connect(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        protocol: Protocol,
        direction: Direction,
    ) -> Result<ConnectionRef, BuildError> {
        self.node_mut(source)?;
        self.node_mut(target)?;
        if source == target {
            return Err(BuildError::SelfConnection(
                self.nodes[source.0.index()].name.clone(),
            ));
        }
        let id = ConnectionId(self.connections.len() as u32);
        self.connections.push(Connection {
            id,
            source: source.0,
            target: target.0,
            protocol,
            direction,
        });
        Ok(ConnectionRef(id))
    }

    /// Attach a claim to the system, a node or a connection.
    ///
    /// Attaching a claim kind to an element type it does not support, or a
    /// second claim of the same kind to one element, is an error.
    pub fn add_claim(
        &mut self,
        kind: ClaimKind,
        target: impl Into<ElementId>,
    ) -> Result<ClaimId, BuildError> {
        let target = target.into();
        let exists = match target {
            ElementId::System => true,
            ElementId::Node(id) => self.nodes.get(id.index()).is_some(),
            ElementId::Connection(id) => self.connections.get(id.index()).is_some(),
        };
        if !exists {
            return Err(match target {
                ElementId::Connection(id) => BuildError::UnknownConnection(id.to_string()),
                other => BuildError::UnknownNode(other.to_string()),
            });
        }
        if !kind.may_attach(target.kind()) {
            return Err(BuildError::ClaimTargetMismatch {
                claim: kind.name().to_string(),
                target: target.kind(),
            });
        }
        if self
            .claims
            .iter()
            .any(|c| c.target == target && c.kind.tag() == kind.tag())
        {
            return Err(BuildError::DuplicateClaim {
                claim: kind.name().to_string(),
                target: target.to_string(),
            });
        }
        let id = ClaimId(self.claims.len() as u32);
        self.claims.push(Claim { id, kind, target });
        Ok(id)
    }

    pub fn node_ref(&self, name: &str) -> Option<NodeRef> {
        self.nodes.iter().find(|n| n.name == name).map(|n| NodeRef(n.id))
    }

    /// Finish construction
    pub fn build(self) -> Result<ModelGraph, BuildError> {
        if self.name.trim().is_empty() {
            return Err(BuildError::Invalid("system name must not be empty".to_string()));
        }
        Ok(ModelGraph::from_parts(
            self.name,
            self.nodes,
            self.connections,
            self.claims,
        ))
    }

    fn node_mut(&mut self, node: NodeRef) -> Result<&mut Node, BuildError> {
        self.nodes
            .get_mut(node.0.index())
            .ok_or_else(|| BuildError::UnknownNode(node.0.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TlsVersion;
    use crate::Severity;

    #[test]
    fn test_claim_target_mismatch_is_fatal() {
        let mut builder = ModelBuilder::new("sys");
        let device = builder.add_node("device", NodeKind::Device).unwrap();
        let result = builder.add_claim(
            ClaimKind::RequiresEncryption {
                min_version: Some(TlsVersion::Tls12),
            },
            device,
        );
        assert!(matches!(
            result,
            Err(BuildError::ClaimTargetMismatch {
                target: ElementKind::Node,
                ..
            })
        ));
        assert!(matches!(
            builder.add_claim(ClaimKind::NoUnauthorizedFlow, device),
            Err(BuildError::ClaimTargetMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_claim_kind_on_element() {
        let mut builder = ModelBuilder::new("sys");
        let device = builder.add_node("device", NodeKind::Device).unwrap();
        let high = ClaimKind::NoKnownVulnerabilities {
            max_severity: Severity::High,
        };
        let low = ClaimKind::NoKnownVulnerabilities {
            max_severity: Severity::Low,
        };
        builder.add_claim(high, device).unwrap();
        assert!(matches!(
            builder.add_claim(low.clone(), device),
            Err(BuildError::DuplicateClaim { .. })
        ));
        // Same kind on another scope is fine
        builder.add_claim(low, ElementId::System).unwrap();
    }

    #[test]
    fn test_structural_errors() {
        let mut builder = ModelBuilder::new("sys");
        let device = builder.add_node("device", NodeKind::Device).unwrap();
        assert!(matches!(
            builder.add_node("device", NodeKind::Backend),
            Err(BuildError::DuplicateNode(_))
        ));
        assert!(matches!(
            builder.add_connection(device, device, Protocol::tls(443)),
            Err(BuildError::SelfConnection(_))
        ));
        assert!(matches!(
            builder.add_address_str(device, "bad address!"),
            Err(BuildError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_build_assigns_stable_ids() {
        let mut builder = ModelBuilder::new("sys");
        let a = builder.add_node("a", NodeKind::Device).unwrap();
        let b = builder.add_node("b", NodeKind::Backend).unwrap();
        builder.add_address_str(a, "10.0.0.1").unwrap();
        builder
            .add_software(a, SoftwareComponent::new("openssl", Some("3.0.8")))
            .unwrap();
        let c = builder.add_connection(a, b, Protocol::tls(443)).unwrap();
        let model = builder.build().unwrap();

        assert_eq!(model.node(a.id()).unwrap().name, "a");
        assert_eq!(model.connection(c.id()).unwrap().target, b.id());
        assert!(model.node(a.id()).unwrap().component("OpenSSL").is_some());
    }
}
