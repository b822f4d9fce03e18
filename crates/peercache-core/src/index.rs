use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, SampleName};

/// Read-mostly map of which node advertises which cached samples.
///
/// Built and refreshed by an external collaborator that collects per-node
/// cache listings; this core only queries it. Membership is a hint: the
/// remote node may have evicted a sample between index refresh and fetch,
/// so callers must revalidate through the fetch outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationIndex {
    nodes: BTreeMap<NodeId, BTreeSet<SampleName>>,
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `node`'s advertised cache listing.
    pub fn insert_node(&mut self, node: NodeId, names: impl IntoIterator<Item = SampleName>) {
        self.nodes.insert(node, names.into_iter().collect());
    }

    pub fn remove_node(&mut self, node: &NodeId) {
        self.nodes.remove(node);
    }

    /// Returns some node other than `excluding` that advertises `name`.
    ///
    /// Tie-break is deterministic: the lowest node id wins (BTreeMap order),
    /// so prefetch load distribution is reproducible across runs.
    pub fn lookup(&self, name: &SampleName, excluding: &NodeId) -> Option<&NodeId> {
        self.nodes
            .iter()
            .filter(|(node, _)| *node != excluding)
            .find(|(_, names)| names.contains(name))
            .map(|(node, _)| node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
