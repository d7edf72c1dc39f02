use serde::Serialize;

use crate::planner::{Leaf, QueryText};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnionType {
    /// Duplicates removed across branches.
    Union,
    /// Rows appended as they come.
    UnionAll,
}

impl UnionType {
    /// Result group used by the merge stage: 1 deduplicates, 2 appends.
    pub fn result_group(self) -> u8 {
        match self {
            UnionType::Union => 1,
            UnionType::UnionAll => 2,
        }
    }
}

/// How a nested subplan's result reaches its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubplanKind {
    /// Produces one value, substituted into the parent text by placeholder number.
    Scalar { placeholder: usize },
    /// Produces rows in `table`, joined in the parent's FROM list.
    Relation { table: String },
}

#[derive(Debug, Clone)]
pub struct Subplan {
    pub kind: SubplanKind,
    pub plan: QueryPlan,
}

/// One branch of a union; `union_type` connects it to the branch before it
/// and is ignored for the first branch.
#[derive(Debug, Clone)]
pub struct UnionBranch {
    pub union_type: UnionType,
    pub plan: QueryPlan,
}

/// A column of the client-visible result.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub expression: QueryText,
    pub alias: String,
    /// Column of the last step's output the value is read from when the
    /// final statement wraps that step.
    pub source_column: String,
}

impl OutputColumn {
    pub fn new(expression: impl Into<QueryText>, alias: &str, source_column: &str) -> Self {
        Self { expression: expression.into(), alias: alias.to_string(), source_column: source_column.to_string() }
    }
}

/// ORDER BY entry, addressed by 1-based output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderKey {
    pub position: usize,
    pub descending: bool,
}

/// One node of the logical plan tree handed over by the planner.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub leaves: Vec<Leaf>,
    pub subplans: Vec<Subplan>,
    pub union_branches: Vec<UnionBranch>,
    pub final_projection: Vec<OutputColumn>,
    pub order_by: Vec<OrderKey>,
    pub is_distinct: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub is_top_level: bool,
    pub is_final_union_part: bool,
    /// Existing table the result is materialized into.
    pub into_table: Option<String>,
}

impl QueryPlan {
    pub fn new(leaves: Vec<Leaf>) -> Self {
        Self { leaves, ..Default::default() }
    }

    pub fn top_level(leaves: Vec<Leaf>) -> Self {
        Self { leaves, is_top_level: true, ..Default::default() }
    }

    pub fn is_union(&self) -> bool {
        !self.union_branches.is_empty()
    }

    /// Result group per branch. The first branch joins the group of the
    /// second, since its own connecting type is meaningless.
    pub fn union_result_groups(&self) -> Vec<u8> {
        let mut groups: Vec<u8> = self.union_branches.iter().map(|b| b.union_type.result_group()).collect();
        if groups.len() > 1 {
            groups[0] = groups[1];
        }
        groups
    }

    pub fn last_leaf(&self) -> Option<&Leaf> {
        self.leaves.last()
    }
}
