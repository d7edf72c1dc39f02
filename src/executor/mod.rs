pub mod row;
pub use row::*;

pub mod helpers;
pub use helpers::*;

pub mod merge_error;
pub use merge_error::*;

pub mod result_source;
pub use result_source::*;

pub mod position_manager;
pub use position_manager::*;

pub mod combined_result;
pub use combined_result::*;
