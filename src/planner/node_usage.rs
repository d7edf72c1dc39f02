use indexmap::IndexMap;
use serde::Serialize;

use crate::database::NodeId;

/// Role of one node in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NodeUsage {
    pub node_id: NodeId,
    /// Runs the step's query.
    pub is_producer: bool,
    /// Receives the step's output rows.
    pub is_consumer: bool,
}

impl NodeUsage {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id, is_producer: false, is_consumer: false }
    }
}

/// Per-step usage table, ordered by first appearance.
pub type NodeUsageTable = IndexMap<NodeId, NodeUsage>;

/// Build a usage table from producer and consumer lists.
pub fn build_usage_table(producers: &[NodeId], consumers: &[NodeId]) -> NodeUsageTable {
    let mut table = NodeUsageTable::new();
    for &n in producers {
        table.entry(n).or_insert_with(|| NodeUsage::new(n)).is_producer = true;
    }
    for &n in consumers {
        table.entry(n).or_insert_with(|| NodeUsage::new(n)).is_consumer = true;
    }
    table
}
