use std::sync::Arc;

use indexmap::IndexMap;

use crate::database::{normalize_node_list, Catalog, NodeId, SysTable};

/// In-memory catalog: table definitions plus the node topology.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    tables: IndexMap<String, Arc<SysTable>>,
    coordinator: NodeId,
    nodes: Vec<NodeId>,
}

impl MemoryCatalog {
    pub fn new(coordinator: NodeId, nodes: &[NodeId]) -> Self {
        let mut nodes = nodes.to_vec();
        normalize_node_list(&mut nodes);
        Self { tables: IndexMap::new(), coordinator, nodes }
    }

    pub fn add_table(&mut self, table: SysTable) -> Arc<SysTable> {
        let table = Arc::new(table);
        self.tables.insert(table.name.clone(), Arc::clone(&table));
        table
    }

    pub fn with_table(mut self, table: SysTable) -> Self {
        self.add_table(table);
        self
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}

impl Catalog for MemoryCatalog {
    fn table(&self, name: &str) -> Option<Arc<SysTable>> {
        self.tables.get(&name.to_ascii_lowercase()).map(Arc::clone)
    }

    fn coordinator_node_id(&self) -> NodeId {
        self.coordinator
    }

    fn db_node_list(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }
}
