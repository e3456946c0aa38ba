//! Address to node resolution

use crate::model::{Address, ModelGraph, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where an address binding came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressOrigin {
    /// Declared in the model
    Declared,
    /// Static hint from a batch metafile
    Seeded,
    /// Inferred from evidence
    Learned,
}

/// Known addresses of the model nodes. Addresses are added, never removed.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: HashMap<Address, Vec<(NodeId, AddressOrigin)>>,
    learned: Vec<(Address, NodeId)>,
}

impl AddressBook {
    /// Book holding the declared node addresses
    pub fn new(model: &ModelGraph) -> Self {
        let mut book = Self::default();
        for node in model.nodes() {
            for address in &node.addresses {
                book.insert(address.clone(), node.id, AddressOrigin::Declared);
            }
        }
        book
    }

    fn insert(&mut self, address: Address, node: NodeId, origin: AddressOrigin) -> bool {
        let bound = self.entries.entry(address).or_default();
        if bound.iter().any(|(n, _)| *n == node) {
            return false;
        }
        bound.push((node, origin));
        true
    }

    /// Add a static hint; returns false if the node already had the address
    pub fn seed(&mut self, address: Address, node: NodeId) -> bool {
        self.insert(address, node, AddressOrigin::Seeded)
    }

    /// Attach an unknown address to a node; returns false if the address is
    /// already bound to any node
    pub fn learn(&mut self, address: Address, node: NodeId) -> bool {
        if self.is_known(&address) {
            return false;
        }
        self.learned.push((address.clone(), node));
        self.insert(address, node, AddressOrigin::Learned)
    }

    /// Nodes bound to the address, exact match only
    pub fn resolve(&self, address: &Address) -> &[(NodeId, AddressOrigin)] {
        self.entries.get(address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_known(&self, address: &Address) -> bool {
        !self.resolve(address).is_empty()
    }

    /// Learned addresses in the order they were learned
    pub fn learned(&self) -> &[(Address, NodeId)] {
        &self.learned
    }
}
