pub mod id_type;
pub use id_type::*;

pub mod config;
pub use config::*;

pub mod partition_map;
pub use partition_map::*;

pub mod schema;
pub use schema::*;

pub mod catalog;
pub use catalog::*;
