pub mod expression_type;
pub use expression_type::*;

pub mod sys_table;
pub use sys_table::*;

use std::sync::Arc;

use crate::database::NodeId;

/// Metadata the planner needs from the catalog.
pub trait Catalog {
    /// Look up a table by name (case-insensitive). `None` for relations the
    /// catalog does not know, such as view-backed or synthetic ones.
    fn table(&self, name: &str) -> Option<Arc<SysTable>>;

    fn coordinator_node_id(&self) -> NodeId;

    /// Every database node taking part in query execution.
    fn db_node_list(&self) -> Vec<NodeId>;
}
