use std::sync::Arc;

use crate::database::{Catalog, NodeId, PlannerConfig, SysTable};

/// Read-only inputs shared by every stage of one compilation.
#[derive(Clone, Copy)]
pub struct CompileContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub config: &'a PlannerConfig,
}

impl<'a> CompileContext<'a> {
    pub fn new(catalog: &'a dyn Catalog, config: &'a PlannerConfig) -> Self {
        Self { catalog, config }
    }

    pub fn coordinator(&self) -> NodeId {
        self.catalog.coordinator_node_id()
    }

    pub fn db_nodes(&self) -> Vec<NodeId> {
        self.catalog.db_node_list()
    }

    pub fn table(&self, name: &str) -> Option<Arc<SysTable>> {
        self.catalog.table(name)
    }

    /// `nodes` when non-empty, all database nodes otherwise.
    pub fn nodes_or_all(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        if nodes.is_empty() { self.db_nodes() } else { nodes.to_vec() }
    }
}
