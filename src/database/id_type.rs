/// Identifier of a physical database node.
pub type NodeId = i32;

/// Sort and dedupe a node list in place.
pub fn normalize_node_list(nodes: &mut Vec<NodeId>) {
    nodes.sort_unstable();
    nodes.dedup();
}
