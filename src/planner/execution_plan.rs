use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::{
    database::{Catalog, ExpressionType, NodeId, PartitionScheme, PlannerConfig},
    planner::{
        CompileContext, Destination, ExecutionStep, FromRelation, HashDestination, Leaf, LeafKind, OrderKey, OutputColumn,
        PlannerError, PlannerResult, QueryPlan, QueryText, SubplanKind,
    },
};

/// Alias of the wrapped last-step statement when final projections are
/// applied around it.
const FINAL_WRAP_ALIAS: &str = "XFINAL";

/// Alias of a union branch's windowed result re-sorted in the union's order.
const BRANCH_WRAP_ALIAS: &str = "XBRANCH";

/// Index of a plan in its [`PlanTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PlanId(pub usize);

/// Why a plan exists, relative to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanRole {
    Top,
    Scalar { placeholder: usize },
    Relation { table: String },
    Correlated,
    Uncorrelated,
    UnionBranch { group: u8 },
    Outer,
}

impl PlanRole {
    fn name(&self) -> &'static str {
        match self {
            PlanRole::Top => "top",
            PlanRole::Scalar { .. } => "scalar",
            PlanRole::Relation { .. } => "relation",
            PlanRole::Correlated => "correlated",
            PlanRole::Uncorrelated => "uncorrelated",
            PlanRole::UnionBranch { .. } => "union_branch",
            PlanRole::Outer => "outer",
        }
    }
}

/// The compiled form of one [`QueryPlan`].
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub id: PlanId,
    pub parent: Option<PlanId>,
    pub role: PlanRole,
    pub steps: Vec<ExecutionStep>,
    pub union_children: Vec<PlanId>,
    pub scalar_children: Vec<PlanId>,
    pub relation_children: Vec<PlanId>,
    pub is_union: bool,
    pub is_top_level: bool,
    pub is_final_union_part: bool,
    /// Select list of the client-visible result.
    pub final_projection: Option<QueryText>,
    /// Table the final step writes, when it materializes.
    pub final_table: Option<String>,
    pub node_drop_list: Vec<String>,
    pub coord_drop_list: Vec<String>,
    pub correlated_depth: usize,
    pub order_by: Vec<OrderKey>,
    pub is_distinct: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// LIMIT still to apply when node streams are merged.
    pub merge_limit: Option<u64>,
    /// OFFSET still to apply when node streams are merged.
    pub merge_offset: Option<u64>,
}

impl ExecutionPlan {
    fn new(id: PlanId, parent: Option<PlanId>, role: PlanRole, query: &QueryPlan, correlated_depth: usize) -> Self {
        Self {
            id,
            parent,
            role,
            steps: Vec::new(),
            union_children: Vec::new(),
            scalar_children: Vec::new(),
            relation_children: Vec::new(),
            is_union: query.is_union(),
            is_top_level: query.is_top_level,
            is_final_union_part: query.is_final_union_part,
            final_projection: None,
            final_table: None,
            node_drop_list: Vec::new(),
            coord_drop_list: Vec::new(),
            correlated_depth,
            order_by: query.order_by.clone(),
            is_distinct: query.is_distinct,
            limit: query.limit,
            offset: query.offset,
            merge_limit: None,
            merge_offset: None,
        }
    }

    pub fn last_step(&self) -> Option<&ExecutionStep> {
        self.steps.last()
    }

    /// Union result group of the plan's result, 0 outside unions.
    pub fn union_result_group(&self) -> u8 {
        match self.role {
            PlanRole::UnionBranch { group } => group,
            _ => 0,
        }
    }

    pub fn explain(&self) -> Value {
        json!({
            "id": self.id.0,
            "parent": self.parent.map(|p| p.0),
            "role": self.role.name(),
            "union": self.is_union,
            "union_children": self.union_children.iter().map(|p| p.0).collect::<Vec<_>>(),
            "scalar_children": self.scalar_children.iter().map(|p| p.0).collect::<Vec<_>>(),
            "relation_children": self.relation_children.iter().map(|p| p.0).collect::<Vec<_>>(),
            "final_projection": self.final_projection.as_ref().map(|q| q.to_string()),
            "final_table": self.final_table,
            "node_drop": self.node_drop_list,
            "coordinator_drop": self.coord_drop_list,
            "merge_limit": self.merge_limit,
            "merge_offset": self.merge_offset,
            "steps": self.steps.iter().map(ExecutionStep::explain).collect::<Vec<_>>(),
        })
    }
}

/// Arena of every plan compiled for one statement. Parents refer to children
/// and children to parents by [`PlanId`].
#[derive(Debug, Clone)]
pub struct PlanTree {
    plans: Vec<ExecutionPlan>,
    root: PlanId,
    coordinator: NodeId,
}

impl PlanTree {
    /// Compile `query` and correct destinations across the whole tree.
    pub fn compile(query: QueryPlan, catalog: &dyn Catalog, config: &PlannerConfig) -> PlannerResult<Self> {
        let ctx = CompileContext::new(catalog, config);
        let mut compiler = PlanCompiler { ctx, plans: Vec::new(), temp_counter: 0, union_order: Vec::new() };
        let root = compiler.compile_plan(query, None, PlanRole::Top, 0)?;
        let mut tree = PlanTree { plans: compiler.plans, root, coordinator: ctx.coordinator() };
        tree.correct_destinations();
        tree.collect_drop_lists();
        debug!(plans = tree.plans.len(), steps = tree.step_count(), "plan compiled");
        Ok(tree)
    }

    pub fn root(&self) -> &ExecutionPlan {
        &self.plans[self.root.0]
    }

    pub fn root_id(&self) -> PlanId {
        self.root
    }

    pub fn plan(&self, id: PlanId) -> Option<&ExecutionPlan> {
        self.plans.get(id.0)
    }

    pub fn plans(&self) -> &[ExecutionPlan] {
        &self.plans
    }

    pub fn coordinator(&self) -> NodeId {
        self.coordinator
    }

    pub fn steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.plans.iter().flat_map(|p| p.steps.iter())
    }

    pub fn steps_mut(&mut self) -> impl Iterator<Item = &mut ExecutionStep> {
        self.plans.iter_mut().flat_map(|p| p.steps.iter_mut())
    }

    pub fn step_mut(&mut self, plan: PlanId, index: usize) -> Option<&mut ExecutionStep> {
        self.plans.get_mut(plan.0).and_then(|p| p.steps.get_mut(index))
    }

    pub fn step_count(&self) -> usize {
        self.plans.iter().map(|p| p.steps.len()).sum()
    }

    /// Repair destinations the single forward pass could not know.
    ///
    /// Plans are allocated parent first, so walking the arena backwards
    /// visits every child before its parent.
    pub fn correct_destinations(&mut self) {
        let coordinator = self.coordinator;
        for idx in (0..self.plans.len()).rev() {
            if let PlanRole::Relation { table } = &self.plans[idx].role {
                let table = table.clone();
                let reader = self.plans[idx]
                    .parent
                    .and_then(|p| self.plans.get(p.0))
                    .and_then(|parent| parent.steps.iter().find(|s| s.reads_table(&table)))
                    .cloned();
                if let (Some(reader), Some(last)) = (reader, self.plans[idx].steps.last_mut()) {
                    last.correct_destination(&reader, true, coordinator);
                }
            }

            let steps = &mut self.plans[idx].steps;
            for i in 1..steps.len() {
                let (head, tail) = steps.split_at_mut(i);
                head[i - 1].correct_destination(&tail[0], false, coordinator);
            }
        }
    }

    fn collect_drop_lists(&mut self) {
        for idx in (0..self.plans.len()).rev() {
            let mut node_drops = Vec::new();
            let mut coord_drops = Vec::new();
            for step in &self.plans[idx].steps {
                node_drops.extend(step.node_detail.drop_list.iter().cloned());
                if let Some(c) = &step.coord_detail {
                    coord_drops.extend(c.drop_list.iter().cloned());
                }
            }
            for child in self.plans[idx].union_children.clone() {
                node_drops.extend(self.plans[child.0].node_drop_list.iter().cloned());
                coord_drops.extend(self.plans[child.0].coord_drop_list.iter().cloned());
            }
            dedup_names(&mut node_drops);
            dedup_names(&mut coord_drops);
            self.plans[idx].node_drop_list = node_drops;
            self.plans[idx].coord_drop_list = coord_drops;
        }
    }

    pub fn explain(&self) -> Value {
        json!({
            "root": self.root.0,
            "coordinator": self.coordinator,
            "plans": self.plans.iter().map(ExecutionPlan::explain).collect::<Vec<_>>(),
        })
    }
}

fn dedup_names(names: &mut Vec<String>) {
    let mut seen = Vec::<String>::new();
    names.retain(|n| {
        let key = n.to_ascii_lowercase();
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}

struct PlanCompiler<'a> {
    ctx: CompileContext<'a>,
    plans: Vec<ExecutionPlan>,
    temp_counter: usize,
    /// ORDER BY of the top-level union whose branches are being compiled.
    union_order: Vec<OrderKey>,
}

impl PlanCompiler<'_> {
    fn temp_name(&mut self, prefix: &str) -> String {
        self.temp_counter += 1;
        format!("{prefix}{}", self.temp_counter)
    }

    fn plan_mut(&mut self, id: PlanId) -> &mut ExecutionPlan {
        &mut self.plans[id.0]
    }

    fn compile_plan(
        &mut self,
        query: QueryPlan,
        parent: Option<PlanId>,
        role: PlanRole,
        correlated_depth: usize,
    ) -> PlannerResult<PlanId> {
        let id = PlanId(self.plans.len());
        trace!(plan = id.0, role = role.name(), "compiling plan");
        self.plans.push(ExecutionPlan::new(id, parent, role, &query, correlated_depth));

        if query.is_union() {
            self.build_union_plan(id, query, correlated_depth)?;
            return Ok(id);
        }

        let QueryPlan {
            mut leaves,
            subplans,
            final_projection,
            order_by,
            is_distinct,
            limit,
            offset,
            is_top_level,
            into_table,
            ..
        } = query;

        for sub in subplans {
            match sub.kind {
                SubplanKind::Scalar { placeholder } => {
                    let child = self.compile_plan(sub.plan, Some(id), PlanRole::Scalar { placeholder }, correlated_depth)?;
                    self.finish_scalar(child);
                    self.plan_mut(id).scalar_children.push(child);
                }
                SubplanKind::Relation { table } => {
                    let child =
                        self.compile_plan(sub.plan, Some(id), PlanRole::Relation { table: table.clone() }, correlated_depth)?;
                    self.finish_relation(child, &table)?;
                    self.plan_mut(id).relation_children.push(child);
                }
            }
        }

        if leaves.is_empty() {
            return Err(PlannerError::EmptyPlan);
        }
        for i in 0..leaves.len() {
            if i > 0 {
                let previous_table = leaves[i - 1].target_table.clone();
                let remap = leaves[i - 1].temp_alias_remap().clone();
                if !remap.is_empty() {
                    leaves[i].update_temp_aliases(&previous_table, &remap);
                }
            }
            if leaves[i].outer_subplan.is_some() && leaves[i].outer_id_positions().is_empty() {
                self.add_outer_identity(&mut leaves[i])?;
            }
            leaves[i].determine_select_statement(self.ctx.config);
        }

        let streams_final = is_top_level && into_table.is_none();
        let coordinator = self.ctx.coordinator();
        let mut steps: Vec<ExecutionStep> = Vec::with_capacity(leaves.len());
        for i in 0..leaves.len() {
            let leaf = &leaves[i];
            let next = leaves.get(i + 1);
            let is_last = next.is_none();
            let mut step = ExecutionStep::convert_from_leaf(leaf, next, leaves.get(i + 2), &self.ctx, streams_final && is_last)?;
            if let Some(previous) = i.checked_sub(1).map(|p| leaves[p].target_table.clone()) {
                let detail = step.producing_detail_mut();
                detail.is_consumer = true;
                detail.add_drop(&previous);
            }

            for uncorrelated in &leaf.uncorrelated_subplans {
                let child = self.compile_plan(uncorrelated.clone(), Some(id), PlanRole::Uncorrelated, correlated_depth)?;
                let readers = self.ctx.nodes_or_all(&step.producing_detail().producer_nodes);
                if let Some(table) = self.finish_uncorrelated(child, &readers) {
                    step.producing_detail_mut().add_drop(&table);
                }
                step.uncorrelated_subplans.push(child);
            }

            if let Some(sub) = &leaf.subplan {
                let mut sub = (**sub).clone();
                if leaf.child_correlated_hashable.is_none() {
                    if let Some(last) = sub.leaves.last_mut() {
                        last.add_xnodeid();
                    }
                }
                let child = self.compile_plan(sub, Some(id), PlanRole::Correlated, correlated_depth + 1)?;
                if let Some(last) = self.plans[child.0].steps.last() {
                    let rewritten = ExecutionStep::prepare_correlated_join(last, leaf, &self.ctx);
                    if let Some(slot) = self.plan_mut(child).steps.last_mut() {
                        *slot = rewritten;
                    }
                }
                step.run_on_nodes(&self.ctx.db_nodes(), coordinator);
                step.correlated_subplan = Some(child);
            }

            if let Some(outer) = &leaf.outer_subplan {
                let mut outer = (**outer).clone();
                if let Some(first) = outer.leaves.first_mut() {
                    first.add_xnodeid();
                }
                let child = self.compile_plan(outer, Some(id), PlanRole::Outer, correlated_depth)?;
                let mut node_count = 0;
                if let Some(first) = self.plans[child.0].steps.first() {
                    let rewritten = ExecutionStep::outer_first_step(first, coordinator);
                    node_count = rewritten.producer_count();
                    self.plan_mut(child).steps[0] = rewritten;
                }
                step.node_detail.query.substitute_node_count(node_count);
                step.select_clause.substitute_node_count(node_count);
                step.non_projection_part.substitute_node_count(node_count);
                if let Some(c) = step.coord_detail.as_mut() {
                    c.query.substitute_node_count(node_count);
                }
                step.outer_subplan = Some(child);
            }

            let send_down = match leaf.kind {
                LeafKind::SubqueryDataDown => {
                    let send_table = self.temp_name("XSEND");
                    step.prepare_correlated_parent_and_down_tables(leaf, &send_table, &self.ctx)?
                }
                LeafKind::Regular | LeafKind::SubqueryJoin => Vec::new(),
            };
            steps.push(step);
            steps.extend(send_down);
        }
        self.plan_mut(id).steps = steps;

        if is_top_level {
            let last_leaf = &leaves[leaves.len() - 1];
            match into_table {
                Some(table) => self.finalize_into(id, &table)?,
                None => self.finalize_stream(id, last_leaf, &final_projection, &order_by, is_distinct, limit, offset),
            }
        }
        Ok(id)
    }

    /// Rows of the preserved side of an outer join carry an identity that
    /// survives redistribution.
    fn add_outer_identity(&self, leaf: &mut Leaf) -> PlannerResult<()> {
        let preserved: Vec<FromRelation> =
            leaf.from_relations.iter().filter(|r| r.outer_level == 0).cloned().collect();
        for relation in preserved {
            let Some(table) = self.ctx.table(&relation.table) else { continue };
            leaf.add_outer_id_columns(&table, &relation.alias, self.ctx.config)?;
        }
        Ok(())
    }

    /// Scalar results are read at the coordinator.
    fn finish_scalar(&mut self, id: PlanId) {
        let coordinator = self.ctx.coordinator();
        if let Some(last) = self.plan_mut(id).steps.last_mut() {
            last.apply_destination(Destination::Coordinator, &[coordinator], coordinator);
        }
    }

    /// Relation results are spread over the nodes under the name the parent
    /// joins them by.
    fn finish_relation(&mut self, id: PlanId, table: &str) -> PlannerResult<()> {
        let Some(last) = self.plans[id.0].steps.last() else {
            return Ok(());
        };
        let mut converted = last.convert_to_node_step(&self.ctx);
        if !converted.target_table().is_some_and(|t| t.eq_ignore_ascii_case(table)) {
            let ddl = converted.target_ddl_for(table, self.ctx.config)?;
            converted.producing_detail_mut().set_target(table, Some(ddl));
        }
        let plan = self.plan_mut(id);
        if let Some(slot) = plan.steps.last_mut() {
            *slot = converted;
        }
        plan.final_table = Some(table.to_string());
        Ok(())
    }

    /// Uncorrelated results are copied to every node reading them. Returns
    /// the table they land in.
    fn finish_uncorrelated(&mut self, id: PlanId, readers: &[NodeId]) -> Option<String> {
        let coordinator = self.ctx.coordinator();
        let last = self.plan_mut(id).steps.last_mut()?;
        last.apply_destination(Destination::Broadcast, readers, coordinator);
        last.target_table().map(str::to_string)
    }

    fn build_union_plan(&mut self, id: PlanId, query: QueryPlan, correlated_depth: usize) -> PlannerResult<()> {
        let groups = query.union_result_groups();
        let top_level_stream = query.is_top_level && query.into_table.is_none();
        let nested_table = match &self.plans[id.0].role {
            PlanRole::Relation { table } => Some(table.clone()),
            _ => None,
        };
        let into_table = query.into_table.clone();
        let union_order = if top_level_stream { query.order_by.clone() } else { Vec::new() };
        let saved_order = std::mem::replace(&mut self.union_order, union_order.clone());

        let mut group_tables: [Option<String>; 2] = [None, None];
        let mut combine: Option<ExecutionStep> = None;
        for (branch, group) in query.union_branches.into_iter().zip(groups) {
            let mut plan = branch.plan;
            plan.is_top_level = top_level_stream;
            plan.is_final_union_part = top_level_stream;
            plan.into_table = None;
            if top_level_stream && plan.limit.is_none() && plan.offset.is_none() {
                // nodes sort each branch so the coordinator merge stays ordered
                plan.order_by = union_order.clone();
            }
            let child = self.compile_plan(plan, Some(id), PlanRole::UnionBranch { group }, correlated_depth)?;
            self.plan_mut(id).union_children.push(child);

            let Some(last) = self.plans[child.0].steps.last() else { continue };
            let mut last = if top_level_stream { last.clone() } else { last.convert_to_node_step(&self.ctx) };
            last.producing_detail_mut().union_result_group = group;

            if !top_level_stream {
                // branches of one group share a table on every node
                let slot = usize::from(group.saturating_sub(1).min(1));
                let (table, ddl) = match &group_tables[slot] {
                    Some(t) => (t.clone(), None),
                    None => {
                        let t = self.temp_name("XUNION");
                        let ddl = last.target_ddl_for(&t, self.ctx.config)?;
                        group_tables[slot] = Some(t.clone());
                        (t, Some(ddl))
                    }
                };
                last.producing_detail_mut().set_target(&table, ddl);
                if combine.is_none() {
                    combine = Some(last.clone());
                }
            }
            if let Some(slot) = self.plan_mut(child).steps.last_mut() {
                *slot = last;
            }
        }

        self.union_order = saved_order;

        if top_level_stream {
            let plan = self.plan_mut(id);
            plan.merge_limit = query.limit;
            plan.merge_offset = query.offset;
            return Ok(());
        }

        // one synthetic step folds the branch tables together
        let Some(template) = combine else {
            return Err(PlannerError::EmptyPlan);
        };
        let mut parts = Vec::new();
        let mut sources = Vec::new();
        if let Some(t) = &group_tables[0] {
            parts.push(format!("SELECT DISTINCT * FROM {t}"));
            sources.push(t.clone());
        }
        if let Some(t) = &group_tables[1] {
            parts.push(format!("SELECT * FROM {t}"));
            sources.push(t.clone());
        }
        let target = match nested_table {
            Some(t) => t,
            None => self.temp_name("XUNIONRES"),
        };
        let ddl = template.target_ddl_for(&target, self.ctx.config)?;
        let all = self.ctx.db_nodes();
        let coordinator = self.ctx.coordinator();
        let mut step = ExecutionStep::synthetic(
            QueryText::from(parts.join(" UNION ALL ")),
            &all,
            template.projections.clone(),
            sources.clone(),
            Some((&target, ddl)),
        );
        step.node_detail.is_consumer = true;
        for t in &sources {
            step.node_detail.add_drop(t);
        }
        step.is_final_step = true;
        step.apply_destination(Destination::Coordinator, &[coordinator], coordinator);
        self.plan_mut(id).steps.push(step);

        if let Some(table) = into_table {
            self.finalize_into(id, &table)?;
        }
        Ok(())
    }

    /// Last step of a top-level plan streams to the client.
    #[allow(clippy::too_many_arguments)]
    fn finalize_stream(
        &mut self,
        id: PlanId,
        last_leaf: &Leaf,
        final_projection: &[OutputColumn],
        order_by: &[OrderKey],
        is_distinct: bool,
        limit: Option<u64>,
        offset: Option<u64>,
    ) {
        let transform = self.ctx.config.transform_projections;
        let coordinator = self.ctx.coordinator();
        let distinct = is_distinct || last_leaf.is_distinct;
        let windowed = limit.is_some() || offset.is_some();
        let is_branch = self.plans[id.0].is_final_union_part;
        let Some(last) = self.plans[id.0].steps.last() else { return };
        let columns = output_columns(last, final_projection);

        // a branch's own window or DISTINCT only holds over all of its rows
        if is_branch && last.producer_count() > 1 && (windowed || distinct) {
            if let Some(temp) = last.target_table().map(str::to_string) {
                self.centralize_union_branch(id, &temp, &columns, order_by, distinct, limit, offset);
                return;
            }
        }
        let union_order = if is_branch && windowed { self.union_order.clone() } else { Vec::new() };

        let plan = &mut self.plans[id.0];
        let Some(step) = plan.steps.last_mut() else { return };
        let select_list: Vec<QueryText> = columns
            .iter()
            .map(|c| {
                let mut item = if transform {
                    QueryText::from(format!("{FINAL_WRAP_ALIAS}.{}", c.source_column))
                } else {
                    c.expression.clone()
                };
                item.push_str(" AS ").push_str(&c.alias);
                item
            })
            .collect();
        let select_list = QueryText::join(&select_list, ", ");

        let mut query = QueryText::from("SELECT ");
        if distinct {
            query.push_str("DISTINCT ");
        }
        query.append(&select_list);
        if transform {
            query.push_str(" FROM (").append(&step.select_clause).append(&step.non_projection_part);
            query.push_str(&format!(") {FINAL_WRAP_ALIAS}"));
        } else {
            query.append(&step.non_projection_part);
        }
        append_order_and_window(&mut query, order_by, None, None);

        // one producer applies LIMIT/OFFSET itself; several each return
        // enough rows to cover the global offset and the merge trims
        let producers = step.producer_count();
        if producers <= 1 {
            append_order_and_window(&mut query, &[], limit, offset);
        } else {
            if let Some(l) = limit {
                query.push_str(&format!(" LIMIT {}", l.saturating_add(offset.unwrap_or(0))));
            }
            plan.merge_limit = limit;
            plan.merge_offset = offset;
        }
        if !union_order.is_empty() {
            query = wrap_in_order(&query, &union_order);
        }

        let detail = step.producing_detail_mut();
        detail.query = query;
        detail.clear_target();
        detail.combine_results = true;
        detail.use_load = false;
        step.is_final_step = true;
        step.apply_destination(Destination::CoordinatorFinal, &[], coordinator);
        plan.final_projection = Some(select_list);
        debug!(plan = id.0, producers, limit, offset, "final step streams to coordinator");
    }

    /// Gather a union branch at the coordinator, which applies the branch's
    /// DISTINCT and window and streams the rows in the union's order.
    #[allow(clippy::too_many_arguments)]
    fn centralize_union_branch(
        &mut self,
        id: PlanId,
        temp: &str,
        columns: &[OutputColumn],
        order_by: &[OrderKey],
        distinct: bool,
        limit: Option<u64>,
        offset: Option<u64>,
    ) {
        let coordinator = self.ctx.coordinator();
        let select_list: Vec<QueryText> = columns
            .iter()
            .map(|c| QueryText::from(format!("{FINAL_WRAP_ALIAS}.{} AS {}", c.source_column, c.alias)))
            .collect();
        let select_list = QueryText::join(&select_list, ", ");

        let mut query = QueryText::from(if distinct { "SELECT DISTINCT " } else { "SELECT " });
        query.append(&select_list).push_str(&format!(" FROM {temp} {FINAL_WRAP_ALIAS}"));
        append_order_and_window(&mut query, order_by, limit, offset);
        if !self.union_order.is_empty() {
            query = wrap_in_order(&query, &self.union_order);
        }

        let plan = &mut self.plans[id.0];
        let Some(last) = plan.steps.last_mut() else { return };
        last.is_final_step = false;
        last.apply_destination(Destination::Coordinator, &[coordinator], coordinator);
        let projections = last.projections.clone();

        let mut central = ExecutionStep::synthetic(query, &[coordinator], projections, vec![temp.to_string()], None)
            .on_coordinator(coordinator);
        let detail = central.producing_detail_mut();
        detail.is_consumer = true;
        detail.add_drop(temp);
        detail.combine_results = true;
        detail.use_load = false;
        central.is_final_step = true;
        central.apply_destination(Destination::CoordinatorFinal, &[], coordinator);
        plan.steps.push(central);
        plan.final_projection = Some(select_list);
        debug!(plan = id.0, table = temp, limit, offset, "union branch gathered at coordinator");
    }

    /// Last step of a top-level plan writes into an existing table, routed
    /// by that table's own partitioning.
    fn finalize_into(&mut self, id: PlanId, table_name: &str) -> PlannerResult<()> {
        let table = self.ctx.table(table_name).ok_or_else(|| PlannerError::UnknownTable(table_name.to_string()))?;
        let coordinator = self.ctx.coordinator();
        let (limit, offset, order_by) = {
            let plan = &self.plans[id.0];
            (plan.limit, plan.offset, plan.order_by.clone())
        };
        let Some(last) = self.plans[id.0].steps.last() else {
            return Err(PlannerError::EmptyPlan);
        };
        let producers = last.producer_count();
        let produced = last.target_table().map(str::to_string);
        let projections = last.projections.clone();

        let limited = limit.is_some() || offset.is_some();
        if limited && producers > 1 {
            // which rows survive is only defined on one node
            let temp = match produced {
                Some(t) => t,
                None => self.temp_name("XINTO"),
            };
            let mut query = QueryText::from(format!("SELECT * FROM {temp}"));
            append_order_and_window(&mut query, &order_by, limit, offset);

            let plan = self.plan_mut(id);
            if let Some(last) = plan.steps.last_mut() {
                last.is_final_step = false;
                last.apply_destination(Destination::Coordinator, &[coordinator], coordinator);
            }
            let mut central = ExecutionStep::synthetic(query, &[coordinator], projections, vec![temp.clone()], None)
                .on_coordinator(coordinator);
            let detail = central.producing_detail_mut();
            detail.is_consumer = true;
            detail.add_drop(&temp);
            plan.steps.push(central);
        } else if limited {
            if let Some(last) = self.plan_mut(id).steps.last_mut() {
                let mut window = QueryText::new();
                append_order_and_window(&mut window, &[], limit, offset);
                last.producing_detail_mut().query.append(&window);
            }
        }

        let plan = self.plan_mut(id);
        let Some(last) = plan.steps.last_mut() else {
            return Err(PlannerError::EmptyPlan);
        };
        let destination = match table.partition_scheme {
            PartitionScheme::Hash => {
                let column = table.partitioned_column.clone().unwrap_or_default();
                let pos = last.projection_position(&column).ok_or_else(|| PlannerError::MissingPartitionColumn {
                    table: table.name.clone(),
                    column: column.clone(),
                })?;
                let key_type = table
                    .partitioned_column_type()
                    .or(last.projections[pos].ty)
                    .unwrap_or_else(ExpressionType::text);
                Destination::Hash(HashDestination::single(pos, Arc::clone(&table.partition_map), key_type))
            }
            PartitionScheme::Robin => match table.partition_map.all_partitions().first() {
                Some(&node) => Destination::SingleNode(node),
                None => Destination::Broadcast,
            },
            PartitionScheme::Lookup => Destination::Broadcast,
            PartitionScheme::One => match table.partition_map.all_partitions().first() {
                Some(&node) => Destination::SingleNode(node),
                None => Destination::Coordinator,
            },
        };
        debug!(plan = id.0, table = %table.name, destination = destination.name(), "final step materializes");
        last.producing_detail_mut().set_target(&table.name, None);
        last.is_final_step = true;
        last.apply_destination(destination, &table.nodes, coordinator);
        plan.final_table = Some(table.name.clone());
        Ok(())
    }
}

/// Output columns of a streamed result: the explicit final projection, or
/// every column of the last step.
fn output_columns(step: &ExecutionStep, final_projection: &[OutputColumn]) -> Vec<OutputColumn> {
    if final_projection.is_empty() {
        step.projections
            .iter()
            .map(|p| OutputColumn::new(p.expression.clone(), &p.column_name, &p.column_name))
            .collect()
    } else {
        final_projection.to_vec()
    }
}

fn wrap_in_order(query: &QueryText, order_by: &[OrderKey]) -> QueryText {
    let mut wrapped = QueryText::from("SELECT * FROM (");
    wrapped.append(query).push_str(&format!(") {BRANCH_WRAP_ALIAS}"));
    append_order_and_window(&mut wrapped, order_by, None, None);
    wrapped
}

fn append_order_and_window(query: &mut QueryText, order_by: &[OrderKey], limit: Option<u64>, offset: Option<u64>) {
    if !order_by.is_empty() {
        let keys: Vec<String> = order_by
            .iter()
            .map(|k| if k.descending { format!("{} DESC", k.position) } else { k.position.to_string() })
            .collect();
        query.push_str(" ORDER BY ").push_str(&keys.join(", "));
    }
    if let Some(l) = limit {
        query.push_str(&format!(" LIMIT {l}"));
    }
    if let Some(o) = offset {
        query.push_str(&format!(" OFFSET {o}"));
    }
}
