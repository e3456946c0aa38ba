//! JSON model description
//!
//! A declarative description of nodes, connections and claims, turned into a
//! [`ModelGraph`] through the [`ModelBuilder`].
//!
//! Claim targets are written as `system`, `node:<name>` or
//! `connection:<source>-><target>`; a `:<port>` suffix selects among several
//! connections between the same pair.

use super::{
    AppProtocol, BuildError, ConnectionRef, ElementId, ModelBuilder, ModelGraph, NodeKind,
    Protocol, SoftwareComponent, TlsVersion, Transport,
};
use crate::claims::ClaimKind;
use crate::CoreResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescription {
    pub system: String,
    #[serde(default)]
    pub nodes: Vec<NodeDescription>,
    #[serde(default)]
    pub connections: Vec<ConnectionDescription>,
    #[serde(default)]
    pub claims: Vec<ClaimDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescription {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub software: Vec<SoftwareComponent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescription {
    pub source: String,
    pub target: String,
    pub protocol: AppProtocol,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub min_tls: Option<TlsVersion>,
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default)]
    pub bidirectional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimDescription {
    pub target: String,
    #[serde(flatten)]
    pub kind: ClaimKind,
}

impl ModelDescription {
    /// Load a model description from a JSON file
    pub fn load(path: &Path) -> CoreResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Build the model graph, aborting on the first structural error
    pub fn build(&self) -> Result<ModelGraph, BuildError> {
        let mut builder = ModelBuilder::new(&self.system);

        for decl in &self.nodes {
            let kind: NodeKind = decl.kind.parse().map_err(BuildError::Invalid)?;
            let node = builder.add_node(&decl.name, kind)?;
            for address in &decl.addresses {
                builder.add_address_str(node, address)?;
            }
            for component in &decl.software {
                builder.add_software(node, component.clone())?;
            }
        }

        let mut connections: Vec<(String, String, Option<u16>, ConnectionRef)> = Vec::new();
        for decl in &self.connections {
            let source = builder
                .node_ref(&decl.source)
                .ok_or_else(|| BuildError::UnknownNode(decl.source.clone()))?;
            let target = builder
                .node_ref(&decl.target)
                .ok_or_else(|| BuildError::UnknownNode(decl.target.clone()))?;

            let mut protocol = Protocol::new(decl.protocol.clone());
            if let Some(transport) = decl.transport {
                protocol = protocol.with_transport(transport);
            }
            if let Some(port) = decl.port {
                protocol = protocol.with_port(port);
            }
            if let Some(version) = decl.min_tls {
                protocol = protocol.with_min_tls(version);
            }
            for cipher in &decl.ciphers {
                protocol = protocol.with_cipher_requirement(cipher);
            }
            let port = protocol.effective_port();

            let conn = if decl.bidirectional {
                builder.add_bidirectional_connection(source, target, protocol)?
            } else {
                builder.add_connection(source, target, protocol)?
            };
            connections.push((decl.source.clone(), decl.target.clone(), port, conn));
        }

        for claim in &self.claims {
            let target = resolve_target(&builder, &connections, &claim.target)?;
            builder.add_claim(claim.kind.clone(), target)?;
        }

        builder.build()
    }
}

fn resolve_target(
    builder: &ModelBuilder,
    connections: &[(String, String, Option<u16>, ConnectionRef)],
    target: &str,
) -> Result<ElementId, BuildError> {
    let target = target.trim();
    if target.eq_ignore_ascii_case("system") {
        return Ok(ElementId::System);
    }
    if let Some(name) = target.strip_prefix("node:") {
        return builder
            .node_ref(name.trim())
            .map(ElementId::from)
            .ok_or_else(|| BuildError::UnknownNode(name.trim().to_string()));
    }
    if let Some(pair) = target.strip_prefix("connection:") {
        let (source, rest) = pair
            .split_once("->")
            .ok_or_else(|| BuildError::UnknownConnection(pair.to_string()))?;
        let (dest, port) = match rest.rsplit_once(':') {
            Some((dest, port)) => {
                let port = port
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| BuildError::UnknownConnection(pair.to_string()))?;
                (dest, Some(port))
            }
            None => (rest, None),
        };
        let found: Vec<&ConnectionRef> = connections
            .iter()
            .filter(|(s, d, p, _)| {
                s == source.trim() && d == dest.trim() && (port.is_none() || *p == port)
            })
            .map(|(_, _, _, c)| c)
            .collect();
        return match found.as_slice() {
            [conn] => Ok(ElementId::from(**conn)),
            [] => Err(BuildError::UnknownConnection(pair.to_string())),
            _ => Err(BuildError::Invalid(format!(
                "'{}' matches several connections, add a ':<port>' suffix",
                pair
            ))),
        };
    }
    Err(BuildError::Invalid(format!("bad claim target '{}'", target)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"{
        "system": "home",
        "nodes": [
            {"name": "device", "kind": "device", "addresses": ["192.168.1.10"],
             "software": [{"name": "openssl", "version": "3.0.8"}]},
            {"name": "backend", "kind": "backend", "addresses": ["api.example.com"]}
        ],
        "connections": [
            {"source": "device", "target": "backend", "protocol": "tls", "port": 443}
        ],
        "claims": [
            {"target": "connection:device->backend", "kind": "requires_encryption",
             "min_version": "TLSv1.2"},
            {"target": "system", "kind": "no_unauthorized_flow"},
            {"target": "node:device", "kind": "no_known_vulnerabilities",
             "max_severity": "medium"}
        ]
    }"#;

    #[test]
    fn test_build_from_json() {
        let decl: ModelDescription = serde_json::from_str(MODEL).unwrap();
        let model = decl.build().unwrap();
        assert_eq!(model.nodes().len(), 2);
        assert_eq!(model.connections().len(), 1);
        assert_eq!(model.claims().len(), 3);
        assert_eq!(
            model.claims()[0].target,
            ElementId::Connection(model.connections()[0].id)
        );
    }

    #[test]
    fn test_mismatched_claim_aborts() {
        let mut decl: ModelDescription = serde_json::from_str(MODEL).unwrap();
        decl.claims.push(ClaimDescription {
            target: "node:backend".to_string(),
            kind: ClaimKind::NoUnauthorizedFlow,
        });
        assert!(matches!(
            decl.build(),
            Err(BuildError::ClaimTargetMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_targets() {
        let mut decl: ModelDescription = serde_json::from_str(MODEL).unwrap();
        decl.claims = vec![ClaimDescription {
            target: "connection:backend->device".to_string(),
            kind: ClaimKind::RequiresEncryption { min_version: None },
        }];
        assert!(matches!(decl.build(), Err(BuildError::UnknownConnection(_))));
    }
}
