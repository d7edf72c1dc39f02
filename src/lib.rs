pub mod database;
pub use database::{Catalog, MemoryCatalog, MergeConfig, NodeId, PlannerConfig, SysTable};

pub mod planner;
pub use planner::{PlanTree, PlannerError, PlannerResult, PreparedHandler, QueryPlan};

pub mod executor;
pub use executor::{CombinedResultSet, MergeError, MergeSpec, NodeResultSet, NodeStream};
