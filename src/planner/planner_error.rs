use thiserror::Error;

pub type PlannerResult<T> = Result<T, PlannerError>;

/// Failures while compiling a plan or binding its parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("expression '{expression}' (column {column}) has no resolved type; intermediate tables need typed columns")]
    UnresolvedProjectionType { column: String, expression: String },

    #[error("select statement of leaf {leaf_id} requested before it was determined")]
    SelectNotDetermined { leaf_id: usize },

    #[error("target table {table} is hash partitioned on {column}, which the query does not produce")]
    MissingPartitionColumn { table: String, column: String },

    #[error("outer join on {table} needs a primary key, unique index or row id (or XDB_USE_OID_IN_OUTER)")]
    NoOuterJoinIdentity { table: String },

    #[error("leaf {leaf_id} sends correlated values down but names no down table")]
    MissingDownTable { leaf_id: usize },

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("parameter {index} is out of range ({supplied} values supplied)")]
    ParameterOutOfRange { index: usize, supplied: usize },

    #[error("parameter {0} has no bound value")]
    UnboundParameter(usize),

    #[error("node count placeholder has no value")]
    UnboundNodeCount,

    #[error("node id placeholder has no value")]
    UnboundNodeId,

    #[error("invalid query template: {0}")]
    InvalidTemplate(String),

    #[error("plan has no steps")]
    EmptyPlan,
}
