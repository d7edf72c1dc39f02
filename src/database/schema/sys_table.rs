use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::database::{
    ExpressionType, HashPartitionMap, NodeId, PartitionMap, ReplicatedPartitionMap, RobinPartitionMap,
    SinglePartitionMap,
};

/// How a table's rows are placed over the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionScheme {
    /// Hashed on the partitioned column.
    Hash,
    /// Round-robin inserts, no value affinity.
    Robin,
    /// Entirely on one node.
    One,
    /// Replicated lookup table.
    Lookup,
}

/// Catalog entry for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysColumn {
    pub name: String,
    pub ty: ExpressionType,
}

/// Catalog entry for one table.
#[derive(Debug, Clone)]
pub struct SysTable {
    pub name: String,
    pub columns: IndexMap<String, SysColumn>,
    pub partition_scheme: PartitionScheme,
    pub partitioned_column: Option<String>,
    pub partition_map: Arc<dyn PartitionMap>,
    pub nodes: Vec<NodeId>,
    pub primary_key: Vec<String>,
    pub unique_indexes: Vec<Vec<String>>,
    /// Explicit row identifier column, when the table declares one.
    pub row_id_column: Option<String>,
}

impl SysTable {
    /// Start a table definition; the partition map follows from `scheme`.
    pub fn new(name: &str, scheme: PartitionScheme, nodes: &[NodeId]) -> Self {
        let partition_map: Arc<dyn PartitionMap> = match scheme {
            PartitionScheme::Hash => Arc::new(HashPartitionMap::new(nodes)),
            PartitionScheme::Robin => Arc::new(RobinPartitionMap::new(nodes)),
            PartitionScheme::One => Arc::new(SinglePartitionMap::new(nodes.iter().copied().min().unwrap_or_default())),
            PartitionScheme::Lookup => Arc::new(ReplicatedPartitionMap::new(nodes)),
        };
        let mut nodes = nodes.to_vec();
        crate::database::normalize_node_list(&mut nodes);
        Self {
            name: name.to_ascii_lowercase(),
            columns: IndexMap::new(),
            partition_scheme: scheme,
            partitioned_column: None,
            partition_map,
            nodes,
            primary_key: Vec::new(),
            unique_indexes: Vec::new(),
            row_id_column: None,
        }
    }

    pub fn with_column(mut self, name: &str, ty: ExpressionType) -> Self {
        let key = name.to_ascii_lowercase();
        self.columns.insert(key.clone(), SysColumn { name: key, ty });
        self
    }

    pub fn partitioned_on(mut self, column: &str) -> Self {
        self.partitioned_column = Some(column.to_ascii_lowercase());
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_unique_index(mut self, columns: &[&str]) -> Self {
        self.unique_indexes.push(columns.iter().map(|c| c.to_ascii_lowercase()).collect());
        self
    }

    pub fn with_row_id(mut self, column: &str) -> Self {
        self.row_id_column = Some(column.to_ascii_lowercase());
        self
    }

    pub fn with_partition_map(mut self, map: Arc<dyn PartitionMap>) -> Self {
        self.partition_map = map;
        self
    }

    pub fn column(&self, name: &str) -> Option<&SysColumn> {
        self.columns.get(&name.to_ascii_lowercase())
    }

    /// Type of the partitioned column, if the table has one and declares it.
    pub fn partitioned_column_type(&self) -> Option<ExpressionType> {
        self.partitioned_column.as_deref().and_then(|c| self.column(c)).map(|c| c.ty)
    }

    /// Columns that uniquely identify a row: primary key, then the first
    /// unique index, then the explicit row id.
    pub fn identity_columns(&self) -> Option<Vec<String>> {
        if !self.primary_key.is_empty() {
            return Some(self.primary_key.clone());
        }
        if let Some(index) = self.unique_indexes.iter().find(|ix| !ix.is_empty()) {
            return Some(index.clone());
        }
        self.row_id_column.as_ref().map(|c| vec![c.clone()])
    }
}
