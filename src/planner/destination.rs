use std::sync::Arc;

use serde_json::{json, Value};

use crate::database::{normalize_node_list, ExpressionType, NodeId, PartitionMap};

/// Separator between composite hash key values; cannot occur in a normalized value.
const COMPOSITE_KEY_SEPARATOR: char = '\u{1f}';

/// Hash routing of produced rows.
#[derive(Debug, Clone)]
pub struct HashDestination {
    /// Projected column positions forming the key; never empty.
    pub columns: Vec<usize>,
    pub partition_map: Arc<dyn PartitionMap>,
    /// Comparison semantics of each key column, used to normalize its value
    /// before hashing; parallel to `columns`.
    pub key_types: Vec<ExpressionType>,
}

impl HashDestination {
    pub fn single(column: usize, partition_map: Arc<dyn PartitionMap>, key_type: ExpressionType) -> Self {
        Self { columns: vec![column], partition_map, key_types: vec![key_type] }
    }

    pub fn composite(columns: Vec<usize>, partition_map: Arc<dyn PartitionMap>, key_types: Vec<ExpressionType>) -> Self {
        Self { columns, partition_map, key_types }
    }

    fn normalize(&self, index: usize, value: &str) -> String {
        match self.key_types.get(index) {
            Some(ty) => ty.normalize_value(value),
            None => value.to_string(),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.columns.len() > 1
    }

    /// Nodes receiving `row`, given its values as text (`None` is NULL).
    pub fn route(&self, row: &[Option<String>]) -> Vec<NodeId> {
        if !self.is_composite() {
            let value = self.columns.first().and_then(|&c| row.get(c)).and_then(|v| v.as_deref());
            let normalized = value.map(|v| self.normalize(0, v));
            return self.partition_map.get_partitions(normalized.as_deref());
        }
        let mut key = String::new();
        for (i, &c) in self.columns.iter().enumerate() {
            if i > 0 {
                key.push(COMPOSITE_KEY_SEPARATOR);
            }
            match row.get(c).and_then(|v| v.as_deref()) {
                Some(v) => key.push_str(&self.normalize(i, v)),
                None => key.push('\u{0}'),
            }
        }
        self.partition_map.get_partitions(Some(&key))
    }
}

/// Where the rows produced by one side of a step go.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Every consumer node gets every row.
    Broadcast,
    /// Rows are centralized at the coordinator for a further step.
    Coordinator,
    /// Rows stream to the coordinator as the client-visible result.
    CoordinatorFinal,
    SingleNode(NodeId),
    Hash(HashDestination),
    /// Full redistribution plus a coordinator copy.
    BroadcastAndCoordinator,
    /// Each row goes to the node named by its node-id column.
    NodeIdColumn { position: usize },
}

impl Destination {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Destination::Coordinator | Destination::CoordinatorFinal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Destination::Broadcast => "broadcast",
            Destination::Coordinator => "coordinator",
            Destination::CoordinatorFinal => "coordinator_final",
            Destination::SingleNode(_) => "single_node",
            Destination::Hash(_) => "hash",
            Destination::BroadcastAndCoordinator => "broadcast_and_coordinator",
            Destination::NodeIdColumn { .. } => "node_id",
        }
    }

    /// Nodes receiving rows: `downstream` are the nodes the next step runs on.
    pub fn consumers(&self, downstream: &[NodeId], coordinator: NodeId) -> Vec<NodeId> {
        let mut nodes = match self {
            Destination::Broadcast => downstream.to_vec(),
            Destination::Coordinator | Destination::CoordinatorFinal => vec![coordinator],
            Destination::SingleNode(n) => vec![*n],
            Destination::Hash(h) => h.partition_map.all_partitions(),
            Destination::BroadcastAndCoordinator => {
                let mut n = downstream.to_vec();
                n.push(coordinator);
                n
            }
            // rows go back to where they came from
            Destination::NodeIdColumn { .. } => downstream.to_vec(),
        };
        normalize_node_list(&mut nodes);
        nodes
    }

    pub fn explain(&self) -> Value {
        match self {
            Destination::SingleNode(n) => json!({ "type": self.name(), "node": n }),
            Destination::Hash(h) => json!({
                "type": self.name(),
                "columns": h.columns,
                "key_types": h.key_types.iter().map(ExpressionType::to_ddl).collect::<Vec<_>>(),
                "map": h.partition_map.kind(),
                "nodes": h.partition_map.all_partitions(),
            }),
            Destination::NodeIdColumn { position } => json!({ "type": self.name(), "position": position }),
            _ => json!({ "type": self.name() }),
        }
    }
}

/// Structural equality; hash destinations compare by columns, key type and
/// the nodes their maps cover.
impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Destination::Hash(a), Destination::Hash(b)) => {
                a.columns == b.columns
                    && a.key_types == b.key_types
                    && a.partition_map.all_partitions() == b.partition_map.all_partitions()
            }
            (Destination::SingleNode(a), Destination::SingleNode(b)) => a == b,
            (Destination::NodeIdColumn { position: a }, Destination::NodeIdColumn { position: b }) => a == b,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}
