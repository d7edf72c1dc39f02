use indexmap::IndexMap;

use crate::{
    database::{ExpressionType, NodeId, PlannerConfig, SysTable},
    planner::{PlannerError, PlannerResult, QueryPlan, QueryText},
};

/// Prefix of generated names for colliding projected columns.
pub const SYNTHETIC_COLUMN_PREFIX: &str = "EXPRESSION";
/// Column carrying the id of the node that produced a row.
pub const XNODEID_COLUMN: &str = "XNODEID";
/// Prefix of outer-join row identity columns.
pub const OUTER_ID_PREFIX: &str = "XOUTERID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Regular,
    /// Feeds a subquery that is joined into its parent.
    SubqueryJoin,
    /// Sends correlated values down into a subquery, through
    /// `correlated_down_table`.
    SubqueryDataDown,
}

/// One projected column of a leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Column name in the produced table.
    pub column_name: String,
    pub expression: QueryText,
    pub ty: Option<ExpressionType>,
}

/// A relation in the leaf's FROM list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromRelation {
    pub table: String,
    pub alias: String,
    /// Nesting level inside outer joins; a relation deeper than the one
    /// before it is attached with LEFT OUTER JOIN.
    pub outer_level: u32,
}

impl FromRelation {
    pub fn new(table: &str, alias: &str) -> Self {
        Self { table: table.to_string(), alias: alias.to_string(), outer_level: 0 }
    }

    pub fn outer(table: &str, alias: &str, outer_level: u32) -> Self {
        Self { table: table.to_string(), alias: alias.to_string(), outer_level }
    }

    fn render(&self) -> String {
        if self.alias.is_empty() || self.alias.eq_ignore_ascii_case(&self.table) {
            self.table.clone()
        } else {
            format!("{} {}", self.table, self.alias)
        }
    }
}

/// A join predicate and the relations (by alias) it references.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinCondition {
    pub expression: QueryText,
    pub aliases: Vec<String>,
}

impl JoinCondition {
    pub fn new(expression: impl Into<QueryText>, aliases: &[&str]) -> Self {
        Self { expression: expression.into(), aliases: aliases.iter().map(|a| a.to_string()).collect() }
    }
}

/// A GROUP BY entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupKey {
    pub expression: QueryText,
    /// Input column the key reads, when it is a plain column of the
    /// previous step's table.
    pub column: Option<String>,
    /// Added by the planner for two-phase aggregation, not by the query.
    pub synthetic: bool,
}

impl GroupKey {
    pub fn column(name: &str, expression: impl Into<QueryText>) -> Self {
        Self { expression: expression.into(), column: Some(name.to_string()), synthetic: false }
    }
}

/// One physical execution unit of the logical plan, with the SQL pieces
/// needed to build its statement.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub leaf_id: usize,
    pub kind: LeafKind,
    /// Base table the leaf scans, when it scans one.
    pub table_name: Option<String>,
    /// Table the leaf's output is materialized into.
    pub target_table: String,
    pub projections: Vec<Projection>,
    pub is_distinct: bool,
    pub from_relations: Vec<FromRelation>,
    pub join_conditions: Vec<JoinCondition>,
    pub conditions: Vec<QueryText>,
    pub group_by: Vec<GroupKey>,
    pub having: Vec<QueryText>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Nodes the leaf's source data lives on.
    pub query_node_list: Vec<NodeId>,
    /// The query runs on the coordinator rather than on the nodes.
    pub runs_on_coordinator: bool,
    /// Second phase of a two-phase aggregate.
    pub is_combiner: bool,
    /// Plain coordinator-side combination of node results.
    pub is_coordinator_combine: bool,
    /// Synthetic step added for outer-join null synthesis.
    pub is_extra_step: bool,
    /// Correlated subquery evaluated for this leaf.
    pub subplan: Option<Box<QueryPlan>>,
    /// Independent branch of an outer join.
    pub outer_subplan: Option<Box<QueryPlan>>,
    pub uncorrelated_subplans: Vec<QueryPlan>,
    /// Table whose partitioning the previous step should match.
    pub hash_table: Option<String>,
    /// Column of the previous step's output that joins `hash_table`'s
    /// partitioned column.
    pub hash_column: Option<String>,
    /// Columns of this leaf's output sent down to a correlated subquery.
    pub parent_correlated_columns: Vec<String>,
    /// Correlated join column of the subquery output that can be hashed.
    pub child_correlated_hashable: Option<String>,
    /// Table the correlated send-down materializes into.
    pub correlated_down_table: Option<String>,
    /// Correlated join executed in a single step.
    pub is_single_step_correlated: bool,
    /// Prepared parameter bound to `table_name`'s partitioned column.
    pub partition_parameter: Option<usize>,

    temp_alias_remap: IndexMap<String, String>,
    ddl_columns: Vec<String>,
    outer_id_positions: Vec<usize>,
    xnodeid_position: Option<usize>,
    select_clause: Option<QueryText>,
    non_projection_part: Option<QueryText>,
    column_counter: usize,
}

impl Leaf {
    pub fn new(leaf_id: usize, target_table: &str) -> Self {
        Self {
            leaf_id,
            kind: LeafKind::Regular,
            table_name: None,
            target_table: target_table.to_string(),
            projections: Vec::new(),
            is_distinct: false,
            from_relations: Vec::new(),
            join_conditions: Vec::new(),
            conditions: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            limit: None,
            offset: None,
            query_node_list: Vec::new(),
            runs_on_coordinator: false,
            is_combiner: false,
            is_coordinator_combine: false,
            is_extra_step: false,
            subplan: None,
            outer_subplan: None,
            uncorrelated_subplans: Vec::new(),
            hash_table: None,
            hash_column: None,
            parent_correlated_columns: Vec::new(),
            child_correlated_hashable: None,
            correlated_down_table: None,
            is_single_step_correlated: false,
            partition_parameter: None,
            temp_alias_remap: IndexMap::new(),
            ddl_columns: Vec::new(),
            outer_id_positions: Vec::new(),
            xnodeid_position: None,
            select_clause: None,
            non_projection_part: None,
            column_counter: 0,
        }
    }

    pub fn with_nodes(mut self, nodes: &[NodeId]) -> Self {
        self.query_node_list = nodes.to_vec();
        self
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table_name = Some(table.to_string());
        self
    }

    pub fn with_from(mut self, relation: FromRelation) -> Self {
        self.from_relations.push(relation);
        self
    }

    pub fn with_join(mut self, condition: JoinCondition) -> Self {
        self.join_conditions.push(condition);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<QueryText>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// Register a projected expression and its temp-table column.
    ///
    /// Returns the column name actually used, which differs from
    /// `column_name` when that name is already taken in this leaf.
    pub fn append_projection(
        &mut self,
        column_name: &str,
        expression: impl Into<QueryText>,
        ty: Option<ExpressionType>,
        is_final_step: bool,
    ) -> PlannerResult<String> {
        let expression = expression.into();
        if ty.is_none() && !is_final_step {
            return Err(PlannerError::UnresolvedProjectionType {
                column: column_name.to_string(),
                expression: expression.to_string(),
            });
        }

        let name = if self.projection_position(column_name).is_some() {
            self.column_counter += 1;
            let synthetic = format!("{}_{}_{}", SYNTHETIC_COLUMN_PREFIX, self.leaf_id, self.column_counter);
            self.temp_alias_remap.insert(column_name.to_string(), synthetic.clone());
            synthetic
        } else {
            column_name.to_string()
        };

        if let Some(t) = ty {
            self.ddl_columns.push(format!("{} {}", name, t.to_ddl()));
        }
        self.projections.push(Projection { column_name: name.clone(), expression, ty });
        Ok(name)
    }

    /// Position of a projected column, matched case-insensitively.
    pub fn projection_position(&self, column_name: &str) -> Option<usize> {
        self.projections.iter().position(|p| p.column_name.eq_ignore_ascii_case(column_name))
    }

    /// Column renames made by [`Leaf::append_projection`] for name collisions.
    pub fn temp_alias_remap(&self) -> &IndexMap<String, String> {
        &self.temp_alias_remap
    }

    /// Apply the previous leaf's column renames to references of its table.
    pub fn update_temp_aliases(&mut self, previous_table: &str, remap: &IndexMap<String, String>) {
        for (old, new) in remap {
            for p in &mut self.projections {
                p.expression.rename_column(previous_table, old, new);
            }
            for j in &mut self.join_conditions {
                j.expression.rename_column(previous_table, old, new);
            }
            for c in self.conditions.iter_mut().chain(self.having.iter_mut()) {
                c.rename_column(previous_table, old, new);
            }
            for g in &mut self.group_by {
                g.expression.rename_column(previous_table, old, new);
                if g.column.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(old)) {
                    g.column = Some(new.clone());
                }
            }
        }
    }

    /// Project the identity of `table` (alias `alias`) so outer-join rows can
    /// be told apart after redistribution. Returns the positions used.
    pub fn add_outer_id_columns(
        &mut self,
        table: &SysTable,
        alias: &str,
        config: &PlannerConfig,
    ) -> PlannerResult<Vec<usize>> {
        let identity: Vec<(String, ExpressionType)> = match table.identity_columns() {
            Some(cols) => cols
                .into_iter()
                .map(|c| {
                    let ty = table.column(&c).map(|sc| sc.ty).unwrap_or_else(ExpressionType::bigint);
                    (c, ty)
                })
                .collect(),
            None if config.use_oid_in_outer => vec![("oid".to_string(), ExpressionType::bigint())],
            None => return Err(PlannerError::NoOuterJoinIdentity { table: table.name.clone() }),
        };

        let mut positions = Vec::with_capacity(identity.len());
        for (col, ty) in identity {
            let name = format!("{}_{}_{}", OUTER_ID_PREFIX, alias, col);
            let name = self.append_projection(&name, format!("{alias}.{col}"), Some(ty), false)?;
            if let Some(pos) = self.projection_position(&name) {
                positions.push(pos);
            }
        }
        self.outer_id_positions.extend(positions.iter().copied());
        Ok(positions)
    }

    pub fn outer_id_positions(&self) -> &[usize] {
        &self.outer_id_positions
    }

    /// Project the id of the producing node. Idempotent.
    pub fn add_xnodeid(&mut self) -> usize {
        if let Some(pos) = self.xnodeid_position {
            return pos;
        }
        let mut expr = QueryText::new();
        expr.push_node_id();
        self.ddl_columns.push(format!("{} {}", XNODEID_COLUMN, ExpressionType::int().to_ddl()));
        self.projections.push(Projection {
            column_name: XNODEID_COLUMN.to_string(),
            expression: expr,
            ty: Some(ExpressionType::int()),
        });
        let pos = self.projections.len() - 1;
        self.xnodeid_position = Some(pos);
        pos
    }

    pub fn xnodeid_position(&self) -> Option<usize> {
        self.xnodeid_position
    }

    /// Table the next-step routing should follow.
    pub fn driving_table(&self) -> Option<&str> {
        self.hash_table.as_deref().or(self.table_name.as_deref())
    }

    /// `CREATE TABLE` text for the leaf's target table.
    pub fn target_ddl(&self, config: &PlannerConfig) -> String {
        config.temp_table_statement(&self.target_table, &self.ddl_columns)
    }

    /// Group keys the query asked for, without planner additions.
    pub fn real_group_keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.group_by.iter().filter(|g| !g.synthetic)
    }

    /// Build the select clause and the FROM..OFFSET part.
    ///
    /// Relations are attached in passes: a relation joins the chain once every
    /// relation its conditions reference is already placed. When a pass places
    /// nothing, the first waiting relation is cross joined and passes resume.
    /// Join conditions never consumed by an ON clause go to WHERE.
    pub fn determine_select_statement(&mut self, config: &PlannerConfig) {
        let mut select = QueryText::from("SELECT ");
        if self.is_distinct {
            select.push_str("DISTINCT ");
        }
        let items: Vec<QueryText> = self
            .projections
            .iter()
            .map(|p| {
                let mut item = p.expression.clone();
                item.push_str(" AS ").push_str(&p.column_name);
                item
            })
            .collect();
        select.append(&QueryText::join(&items, ", "));

        let mut rest = QueryText::new();
        let mut consumed = vec![false; self.join_conditions.len()];
        if let Some(first) = self.from_relations.first() {
            rest.push_str(" FROM ").push_str(&first.render());
            let mut placed: Vec<&str> = vec![first.alias.as_str()];
            let mut previous_level = first.outer_level;
            let mut waiting: Vec<&FromRelation> = self.from_relations.iter().skip(1).collect();

            while !waiting.is_empty() {
                let mut progress = false;
                let mut i = 0;
                while i < waiting.len() {
                    let rel = waiting[i];
                    let attachable: Vec<usize> = self
                        .join_conditions
                        .iter()
                        .enumerate()
                        .filter(|(idx, c)| {
                            !consumed[*idx]
                                && c.aliases.iter().any(|a| a == &rel.alias)
                                && c.aliases.iter().all(|a| a == &rel.alias || placed.contains(&a.as_str()))
                        })
                        .map(|(idx, _)| idx)
                        .collect();
                    if attachable.is_empty() {
                        i += 1;
                        continue;
                    }
                    let join = if rel.outer_level > previous_level { " LEFT OUTER JOIN " } else { " INNER JOIN " };
                    rest.push_str(join).push_str(&rel.render()).push_str(" ON ");
                    let on: Vec<QueryText> = attachable.iter().map(|&idx| self.join_conditions[idx].expression.clone()).collect();
                    rest.append(&QueryText::join(&on, " AND "));
                    for idx in attachable {
                        consumed[idx] = true;
                    }
                    placed.push(rel.alias.as_str());
                    previous_level = rel.outer_level;
                    waiting.remove(i);
                    progress = true;
                }

                if !progress {
                    // nothing joins yet: cross product with the first waiting relation
                    let rel = waiting.remove(0);
                    if rel.outer_level > previous_level {
                        rest.push_str(" LEFT OUTER JOIN ").push_str(&rel.render()).push_str(" ON 1=1");
                    } else if config.use_cross_join {
                        rest.push_str(" CROSS JOIN ").push_str(&rel.render());
                    } else {
                        rest.push_str(", ").push_str(&rel.render());
                    }
                    placed.push(rel.alias.as_str());
                    previous_level = rel.outer_level;
                }
            }
        }

        let mut filters: Vec<QueryText> = self
            .join_conditions
            .iter()
            .zip(consumed.iter())
            .filter(|(_, used)| !**used)
            .map(|(c, _)| c.expression.clone())
            .collect();
        filters.extend(self.conditions.iter().cloned());
        if !filters.is_empty() {
            rest.push_str(" WHERE ").append(&QueryText::join(&filters, " AND "));
        }
        if !self.group_by.is_empty() {
            let keys: Vec<QueryText> = self.group_by.iter().map(|g| g.expression.clone()).collect();
            rest.push_str(" GROUP BY ").append(&QueryText::join(&keys, ", "));
        }
        if !self.having.is_empty() {
            rest.push_str(" HAVING ").append(&QueryText::join(&self.having, " AND "));
        }
        if let Some(limit) = self.limit {
            rest.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            rest.push_str(&format!(" OFFSET {offset}"));
        }

        self.select_clause = Some(select);
        self.non_projection_part = Some(rest);
    }

    pub fn is_select_determined(&self) -> bool {
        self.select_clause.is_some()
    }

    pub fn select_clause(&self) -> PlannerResult<&QueryText> {
        self.select_clause.as_ref().ok_or(PlannerError::SelectNotDetermined { leaf_id: self.leaf_id })
    }

    pub fn non_projection_part(&self) -> PlannerResult<&QueryText> {
        self.non_projection_part.as_ref().ok_or(PlannerError::SelectNotDetermined { leaf_id: self.leaf_id })
    }

    /// Full statement: select clause followed by the FROM..OFFSET part.
    pub fn select_statement(&self) -> PlannerResult<QueryText> {
        let mut q = self.select_clause()?.clone();
        q.append(self.non_projection_part()?);
        Ok(q)
    }
}
