//! Weakest-link aggregation of pair verdicts

use super::{VerdictLedger, VerdictState};
use crate::evidence::StoreCounts;
use crate::model::{ConnectionId, ElementId, NodeId};
use crate::Verdict;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVerdict {
    pub node: NodeId,
    pub name: String,
    /// Over own pairs and the pairs of the node's connections
    pub verdict: Verdict,
    /// Pairs evaluated on the node itself
    pub claims: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionVerdict {
    pub connection: ConnectionId,
    pub name: String,
    pub verdict: Verdict,
    pub claims: usize,
}

/// Pair counts by reported state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub pass: usize,
    pub fail: usize,
    pub inconclusive: usize,
    /// Pinned pairs, also counted under their pinned verdict
    pub overridden: usize,
}

impl VerdictCounts {
    fn add(&mut self, state: VerdictState) {
        match state.verdict() {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::Inconclusive => self.inconclusive += 1,
        }
        if state.is_overridden() {
            self.overridden += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.inconclusive
    }
}

/// Aggregated verdicts of the whole system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemVerdict {
    pub system: String,
    /// Weakest link over every pair of the assessment
    pub verdict: Verdict,
    /// Over the pairs evaluated on the System itself
    pub system_claims: Verdict,
    pub nodes: Vec<NodeVerdict>,
    pub connections: Vec<ConnectionVerdict>,
    pub counts: VerdictCounts,
    pub evidence: StoreCounts,
    /// Ingestion epoch the aggregate was computed at
    pub epoch: u64,
}

/// Compute node, connection and system verdicts from the ledger
pub fn aggregate(ledger: &VerdictLedger, evidence: StoreCounts, epoch: u64) -> SystemVerdict {
    let model = ledger.model();
    let mut counts = VerdictCounts::default();

    let connections: Vec<(ConnectionVerdict, Vec<Verdict>)> = model
        .connections()
        .iter()
        .map(|c| {
            let states = ledger.states(ElementId::Connection(c.id));
            states.iter().for_each(|s| counts.add(*s));
            let verdicts: Vec<Verdict> = states.iter().map(|s| s.verdict()).collect();
            let verdict = ConnectionVerdict {
                connection: c.id,
                name: model.element_name(ElementId::Connection(c.id)),
                verdict: Verdict::weakest_link(verdicts.iter().copied()),
                claims: verdicts.len(),
            };
            (verdict, verdicts)
        })
        .collect();

    let nodes: Vec<NodeVerdict> = model
        .nodes()
        .iter()
        .map(|n| {
            let states = ledger.states(ElementId::Node(n.id));
            states.iter().for_each(|s| counts.add(*s));
            let own: Vec<Verdict> = states.iter().map(|s| s.verdict()).collect();
            let claims = own.len();
            let linked = connections
                .iter()
                .filter(|(c, _)| {
                    model
                        .connection(c.connection)
                        .map(|c| c.touches(n.id))
                        .unwrap_or(false)
                })
                .flat_map(|(_, v)| v.iter().copied());
            NodeVerdict {
                node: n.id,
                name: n.name.clone(),
                verdict: Verdict::weakest_link(own.into_iter().chain(linked)),
                claims,
            }
        })
        .collect();

    let system_states = ledger.states(ElementId::System);
    system_states.iter().for_each(|s| counts.add(*s));
    let system_claims = Verdict::weakest_link(system_states.iter().map(|s| s.verdict()));

    let all = nodes
        .iter()
        .filter(|n| n.claims > 0)
        .map(|n| n.verdict)
        .chain(
            connections
                .iter()
                .filter(|(c, _)| c.claims > 0)
                .map(|(c, _)| c.verdict),
        )
        .chain(system_states.iter().map(|s| s.verdict()));

    SystemVerdict {
        system: model.name.clone(),
        verdict: Verdict::weakest_link(all),
        system_claims,
        nodes,
        connections: connections.into_iter().map(|(c, _)| c).collect(),
        counts,
        evidence,
        epoch,
    }
}
