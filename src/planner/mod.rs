pub mod planner_error;
pub use planner_error::*;

pub mod query_text;
pub use query_text::*;

pub mod node_usage;
pub use node_usage::*;

pub mod destination;
pub use destination::*;

pub mod leaf;
pub use leaf::*;

pub mod query_plan;
pub use query_plan::*;

pub mod compile_context;
pub use compile_context::*;

pub mod step_detail;
pub use step_detail::*;

pub mod execution_step;
pub use execution_step::*;

pub mod execution_plan;
pub use execution_plan::*;

pub mod prepared;
pub use prepared::*;

#[cfg(test)]
pub mod fixtures;
