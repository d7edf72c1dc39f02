use thiserror::Error;

use crate::database::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("node {node} result stream failed: {message}")]
    Node { node: NodeId, message: String },

    #[error("node {node} sent no row within {waited_ms} ms")]
    Timeout { node: NodeId, waited_ms: u64 },

    #[error("sort position {position} is outside a row of {width} columns")]
    SortPosition { position: usize, width: usize },

    #[error("result set is closed")]
    Closed,
}

pub type MergeResult<T> = Result<T, MergeError>;
