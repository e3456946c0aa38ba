//! Structural model of the system under assessment
//!
//! The model is an arena: nodes, connections and claims live in vectors and
//! are referenced by stable indices. It is immutable once built; evidence
//! derived annotations (learned addresses, observed protocols) are kept
//! outside of it by the assessment.

mod address;
mod builder;
mod protocol;
pub mod description;

pub use address::{Address, Endpoint};
pub use builder::{BuildError, ConnectionRef, ModelBuilder, NodeRef};
pub use protocol::{AppProtocol, Protocol, TlsVersion, Transport};

use crate::claims::{Claim, ClaimId};
use crate::evidence::{FlowEncryption, FlowObservation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stable node index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

/// Stable connection index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub(crate) u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl ConnectionId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection#{}", self.0)
    }
}

/// Any element a claim can be attached to or evaluated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementId {
    System,
    Node(NodeId),
    Connection(ConnectionId),
}

impl ElementId {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementId::System => ElementKind::System,
            ElementId::Node(_) => ElementKind::Node,
            ElementId::Connection(_) => ElementKind::Connection,
        }
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementId::System => write!(f, "system"),
            ElementId::Node(id) => write!(f, "{}", id),
            ElementId::Connection(id) => write!(f, "{}", id),
        }
    }
}

impl From<NodeId> for ElementId {
    fn from(id: NodeId) -> Self {
        ElementId::Node(id)
    }
}

impl From<ConnectionId> for ElementId {
    fn from(id: ConnectionId) -> Self {
        ElementId::Connection(id)
    }
}

/// Element type, used to check where a claim kind may attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    System,
    Node,
    Connection,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::System => write!(f, "System"),
            ElementKind::Node => write!(f, "Node"),
            ElementKind::Connection => write!(f, "Connection"),
        }
    }
}

/// Declared role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Device,
    Backend,
    Mobile,
    Generic,
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "device" => Ok(NodeKind::Device),
            "backend" | "remote" | "cloud" => Ok(NodeKind::Backend),
            "mobile" | "app" => Ok(NodeKind::Mobile),
            "generic" | "host" | "" => Ok(NodeKind::Generic),
            other => Err(format!("unknown node kind '{}'", other)),
        }
    }
}

/// Software component declared on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftwareComponent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SoftwareComponent {
    pub fn new(name: &str, version: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            version: version.map(|v| v.to_string()),
        }
    }

    /// Component identity comparison, case-insensitive on the name
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.trim())
    }
}

impl fmt::Display for SoftwareComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} {}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A modeled system participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// Declared addresses; learned ones are tracked by the matcher
    pub addresses: BTreeSet<Address>,
    pub software: Vec<SoftwareComponent>,
}

impl Node {
    pub fn component(&self, name: &str) -> Option<&SoftwareComponent> {
        self.software.iter().find(|c| c.is(name))
    }
}

/// Declared direction of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Directed,
    Bidirectional,
}

/// Orientation of an observation relative to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Observed source is the connection source
    Forward,
    /// Observed source is the connection target (bidirectional only)
    Reverse,
}

/// Declared edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source: NodeId,
    pub target: NodeId,
    pub protocol: Protocol,
    pub direction: Direction,
}

impl Connection {
    pub fn touches(&self, node: NodeId) -> bool {
        self.source == node || self.target == node
    }

    /// Orientation of a source/destination pair, `None` when the pair is
    /// incompatible with the declared direction
    pub fn orientation(&self, src: NodeId, dst: NodeId) -> Option<Orientation> {
        if self.source == src && self.target == dst {
            Some(Orientation::Forward)
        } else if self.direction == Direction::Bidirectional
            && self.source == dst
            && self.target == src
        {
            Some(Orientation::Reverse)
        } else {
            None
        }
    }

    /// Node serving the connection for the given orientation
    pub fn server(&self, orientation: Orientation) -> NodeId {
        match orientation {
            Orientation::Forward => self.target,
            Orientation::Reverse => self.source,
        }
    }

    /// Nodes that accept connections on this edge
    pub fn servers(&self) -> Vec<NodeId> {
        match self.direction {
            Direction::Directed => vec![self.target],
            Direction::Bidirectional => vec![self.source, self.target],
        }
    }
}

/// Evidence-derived annotation of a connection's observed protocol,
/// kept distinct from the declared one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedProtocol {
    pub application: BTreeSet<String>,
    pub tls_versions: BTreeSet<TlsVersion>,
    pub failed_handshakes: usize,
    pub plaintext_flows: usize,
}

impl ObservedProtocol {
    pub fn is_empty(&self) -> bool {
        self.application.is_empty()
            && self.tls_versions.is_empty()
            && self.failed_handshakes == 0
            && self.plaintext_flows == 0
    }

    /// Fold one observed flow into the annotation
    pub fn observe(&mut self, flow: &FlowObservation) {
        if let Some(app) = &flow.application {
            self.application.insert(app.to_string());
        }
        match &flow.encryption {
            FlowEncryption::Plaintext => self.plaintext_flows += 1,
            FlowEncryption::Handshake {
                succeeded: true,
                version,
                ..
            } => {
                if let Some(version) = version {
                    self.tls_versions.insert(*version);
                }
            }
            FlowEncryption::Handshake {
                succeeded: false, ..
            } => self.failed_handshakes += 1,
            FlowEncryption::Unknown => {}
        }
    }
}

/// Complete, immutable system model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGraph {
    pub name: String,
    nodes: Vec<Node>,
    connections: Vec<Connection>,
    claims: Vec<Claim>,
}

impl ModelGraph {
    pub(crate) fn from_parts(
        name: String,
        nodes: Vec<Node>,
        connections: Vec<Connection>,
        claims: Vec<Claim>,
    ) -> Self {
        Self {
            name,
            nodes,
            connections,
            claims,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.index())
    }

    pub fn claim(&self, id: ClaimId) -> Option<&Claim> {
        self.claims.get(id.index())
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Does the element exist in this model
    pub fn contains(&self, element: ElementId) -> bool {
        match element {
            ElementId::System => true,
            ElementId::Node(id) => self.node(id).is_some(),
            ElementId::Connection(id) => self.connection(id).is_some(),
        }
    }

    /// All elements: system first, then nodes, then connections
    pub fn elements(&self) -> impl Iterator<Item = ElementId> + '_ {
        std::iter::once(ElementId::System)
            .chain(self.nodes.iter().map(|n| ElementId::Node(n.id)))
            .chain(self.connections.iter().map(|c| ElementId::Connection(c.id)))
    }

    /// Connections with the node at either end
    pub fn connections_of(&self, node: NodeId) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.iter().filter(move |c| c.touches(node))
    }

    /// Is there any declared edge between the two nodes, in either direction
    pub fn has_edge_between(&self, a: NodeId, b: NodeId) -> bool {
        self.connections
            .iter()
            .any(|c| (c.source == a && c.target == b) || (c.source == b && c.target == a))
    }

    /// Human readable element name
    pub fn element_name(&self, element: ElementId) -> String {
        match element {
            ElementId::System => self.name.clone(),
            ElementId::Node(id) => self
                .node(id)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| id.to_string()),
            ElementId::Connection(id) => match self.connection(id) {
                Some(c) => {
                    let arrow = match c.direction {
                        Direction::Directed => "->",
                        Direction::Bidirectional => "<->",
                    };
                    format!(
                        "{} {} {} ({})",
                        self.element_name(ElementId::Node(c.source)),
                        arrow,
                        self.element_name(ElementId::Node(c.target)),
                        c.protocol
                    )
                }
                None => id.to_string(),
            },
        }
    }
}
