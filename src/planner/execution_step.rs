use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::{
    database::{ExpressionType, HashPartitionMap, NodeId, PlannerConfig},
    planner::{
        build_usage_table, key_types_of, CompileContext, Destination, HashDestination, Leaf, NodeUsageTable,
        PlanId, PlannerError, PlannerResult, Projection, QueryText, StepDetail, XNODEID_COLUMN,
    },
};

/// One step of an execution plan: a node side, an optional coordinator
/// side, and the subplans it depends on.
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    pub leaf_id: usize,
    pub node_detail: StepDetail,
    pub coord_detail: Option<StepDetail>,
    pub node_usage: NodeUsageTable,
    /// Columns of the produced table.
    pub projections: Vec<Projection>,
    pub select_clause: QueryText,
    pub non_projection_part: QueryText,
    /// Tables read by the step's statement.
    pub source_tables: Vec<String>,
    pub xnodeid_position: Option<usize>,
    pub correlated_subplan: Option<PlanId>,
    pub uncorrelated_subplans: Vec<PlanId>,
    pub outer_subplan: Option<PlanId>,
    pub is_extra_step: bool,
    pub is_final_step: bool,
    pub is_outer_step: bool,
    /// Synthetic send-down step of a correlated subquery.
    pub is_correlated_aux: bool,
    /// Table and prepared parameter deciding which nodes produce.
    pub partition_parameter: Option<(String, usize)>,
}

impl ExecutionStep {
    /// Build a step from its leaf, deciding the destination from the
    /// following two leaves.
    pub fn convert_from_leaf(
        leaf: &Leaf,
        next: Option<&Leaf>,
        next_next: Option<&Leaf>,
        ctx: &CompileContext,
        streams_final: bool,
    ) -> PlannerResult<Self> {
        let select_clause = leaf.select_clause()?.clone();
        let non_projection_part = leaf.non_projection_part()?.clone();
        let statement = leaf.select_statement()?;

        let producers = if leaf.runs_on_coordinator {
            vec![ctx.coordinator()]
        } else {
            ctx.nodes_or_all(&leaf.query_node_list)
        };
        let mut detail = StepDetail::producer(statement, &producers);
        detail.set_target(&leaf.target_table, Some(leaf.target_ddl(ctx.config)));
        detail.serial_column_position = leaf.outer_id_positions().first().copied();
        detail.update_producer_step_info(leaf, next, next_next, ctx, streams_final);

        let (node_detail, coord_detail) = if leaf.runs_on_coordinator {
            (StepDetail::idle(), Some(detail))
        } else {
            (detail, None)
        };

        let mut step = Self {
            leaf_id: leaf.leaf_id,
            node_detail,
            coord_detail,
            node_usage: NodeUsageTable::new(),
            projections: leaf.projections.clone(),
            select_clause,
            non_projection_part,
            source_tables: leaf.from_relations.iter().map(|r| r.table.clone()).collect(),
            xnodeid_position: leaf.xnodeid_position(),
            correlated_subplan: None,
            uncorrelated_subplans: Vec::new(),
            outer_subplan: None,
            is_extra_step: leaf.is_extra_step,
            is_final_step: next.is_none(),
            is_outer_step: false,
            is_correlated_aux: false,
            partition_parameter: leaf
                .partition_parameter
                .and_then(|p| leaf.table_name.as_ref().map(|t| (t.clone(), p))),
        };
        step.refresh_node_usage(ctx.coordinator());
        Ok(step)
    }

    /// A synthetic step outside the leaf sequence.
    pub fn synthetic(
        query: QueryText,
        producers: &[NodeId],
        projections: Vec<Projection>,
        source_tables: Vec<String>,
        target: Option<(&str, String)>,
    ) -> Self {
        let mut node_detail = StepDetail::producer(query.clone(), producers);
        if let Some((table, ddl)) = target {
            node_detail.set_target(table, Some(ddl));
        }
        Self {
            leaf_id: 0,
            node_detail,
            coord_detail: None,
            node_usage: NodeUsageTable::new(),
            projections,
            select_clause: query,
            non_projection_part: QueryText::new(),
            source_tables,
            xnodeid_position: None,
            correlated_subplan: None,
            uncorrelated_subplans: Vec::new(),
            outer_subplan: None,
            is_extra_step: false,
            is_final_step: false,
            is_outer_step: false,
            is_correlated_aux: false,
            partition_parameter: None,
        }
    }

    /// Run the step's statement on the coordinator side.
    pub fn on_coordinator(mut self, coordinator: NodeId) -> Self {
        let mut detail = std::mem::replace(&mut self.node_detail, StepDetail::idle());
        detail.producer_nodes = vec![coordinator];
        self.coord_detail = Some(detail);
        self.refresh_node_usage(coordinator);
        self
    }

    /// DDL creating `table` with the step's output columns.
    pub fn target_ddl_for(&self, table: &str, config: &PlannerConfig) -> PlannerResult<String> {
        let mut columns = Vec::with_capacity(self.projections.len());
        for p in &self.projections {
            let ty = p.ty.ok_or_else(|| PlannerError::UnresolvedProjectionType {
                column: p.column_name.clone(),
                expression: p.expression.to_string(),
            })?;
            columns.push(format!("{} {}", p.column_name, ty.to_ddl()));
        }
        Ok(config.temp_table_statement(table, &columns))
    }

    pub fn producing_detail(&self) -> &StepDetail {
        match &self.coord_detail {
            Some(c) if c.is_producer => c,
            _ => &self.node_detail,
        }
    }

    pub fn producing_detail_mut(&mut self) -> &mut StepDetail {
        match &mut self.coord_detail {
            Some(c) if c.is_producer => c,
            _ => &mut self.node_detail,
        }
    }

    pub fn runs_on_coordinator(&self) -> bool {
        self.coord_detail.as_ref().is_some_and(|c| c.is_producer)
    }

    pub fn destination(&self) -> &Destination {
        &self.producing_detail().destination
    }

    pub fn target_table(&self) -> Option<&str> {
        self.producing_detail().target_table.as_deref()
    }

    pub fn producer_count(&self) -> usize {
        self.node_usage.values().filter(|u| u.is_producer).count()
    }

    pub fn consumer_count(&self) -> usize {
        self.node_usage.values().filter(|u| u.is_consumer).count()
    }

    pub fn reads_table(&self, table: &str) -> bool {
        self.source_tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }

    pub fn projection_position(&self, column: &str) -> Option<usize> {
        self.projections.iter().position(|p| p.column_name.eq_ignore_ascii_case(column))
    }

    /// Rebuild the usage table from both sides' producer and consumer lists.
    pub fn refresh_node_usage(&mut self, coordinator: NodeId) {
        let mut producers = Vec::new();
        let mut consumers = Vec::new();
        if self.node_detail.is_producer {
            producers.extend(self.node_detail.producer_nodes.iter().copied());
            consumers.extend(self.node_detail.consumer_nodes.iter().copied());
        }
        if let Some(c) = &self.coord_detail {
            if c.is_producer {
                producers.push(coordinator);
                consumers.extend(c.consumer_nodes.iter().copied());
            }
        }
        self.node_usage = build_usage_table(&producers, &consumers);
    }

    /// Route the produced rows to `destination`; `downstream` are the nodes
    /// of the step that reads them.
    pub fn apply_destination(&mut self, destination: Destination, downstream: &[NodeId], coordinator: NodeId) {
        self.producing_detail_mut().set_destination(destination, downstream, coordinator);
        self.refresh_node_usage(coordinator);
    }

    /// Move production from the coordinator to `nodes`.
    pub fn run_on_nodes(&mut self, nodes: &[NodeId], coordinator: NodeId) {
        if let Some(coord) = self.coord_detail.take() {
            let mut moved = StepDetail::producer(coord.query.clone(), nodes);
            moved.template = coord.template;
            moved.target_table = coord.target_table;
            moved.target_ddl = coord.target_ddl;
            moved.drop_list = coord.drop_list;
            moved.destination = coord.destination;
            moved.consumer_nodes = coord.consumer_nodes;
            moved.use_load = coord.use_load;
            moved.is_consumer = coord.is_consumer;
            self.node_detail = moved;
        } else {
            self.node_detail.producer_nodes = nodes.to_vec();
            crate::database::normalize_node_list(&mut self.node_detail.producer_nodes);
        }
        self.refresh_node_usage(coordinator);
    }

    /// The last step of a correlated subplan, rewritten to send its rows
    /// back to every node so the parent can join them locally: hashed on the
    /// correlated key when it is hashable, routed by producing node otherwise.
    pub fn prepare_correlated_join(sub_last: &ExecutionStep, parent: &Leaf, ctx: &CompileContext) -> ExecutionStep {
        let mut step = sub_last.clone();
        let all = ctx.db_nodes();
        let hashed = parent
            .child_correlated_hashable
            .as_deref()
            .and_then(|c| step.projection_position(c));
        let destination = match (hashed, step.xnodeid_position) {
            (Some(pos), _) => {
                let key_type = step.projections[pos].ty.unwrap_or_else(ExpressionType::text);
                Destination::Hash(HashDestination::single(pos, Arc::new(HashPartitionMap::new(&all)), key_type))
            }
            (None, Some(position)) => Destination::NodeIdColumn { position },
            (None, None) => Destination::Broadcast,
        };
        debug!(leaf = parent.leaf_id, destination = destination.name(), "correlated join return path");
        let detail = step.producing_detail_mut();
        detail.is_consumer = true;
        detail.suppress_send_node_id = hashed.is_some();
        step.apply_destination(destination, &all, ctx.coordinator());
        step
    }

    /// Send-down steps for a correlated subquery fed by this step's leaf:
    /// the correlated values go to the nodes into `send_table`, then a
    /// DISTINCT pass compacts them into the leaf's down table on each node.
    pub fn prepare_correlated_parent_and_down_tables(
        &self,
        leaf: &Leaf,
        send_table: &str,
        ctx: &CompileContext,
    ) -> PlannerResult<Vec<ExecutionStep>> {
        let down_table = leaf
            .correlated_down_table
            .as_deref()
            .ok_or(PlannerError::MissingDownTable { leaf_id: leaf.leaf_id })?;
        let mut columns = Vec::with_capacity(leaf.parent_correlated_columns.len());
        for name in &leaf.parent_correlated_columns {
            let projection = leaf
                .projections
                .iter()
                .find(|p| p.column_name.eq_ignore_ascii_case(name))
                .ok_or_else(|| PlannerError::UnresolvedProjectionType {
                    column: name.clone(),
                    expression: format!("{}.{}", leaf.target_table, name),
                })?;
            let ty = projection.ty.ok_or_else(|| PlannerError::UnresolvedProjectionType {
                column: name.clone(),
                expression: projection.expression.to_string(),
            })?;
            columns.push(Projection {
                column_name: projection.column_name.clone(),
                expression: QueryText::from(projection.column_name.as_str()),
                ty: Some(ty),
            });
        }
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let coordinator = ctx.coordinator();
        let all = ctx.db_nodes();
        let names: Vec<String> = columns.iter().map(|c| c.column_name.clone()).collect();
        let ddl_columns: Vec<String> = columns
            .iter()
            .filter_map(|c| c.ty.map(|t| format!("{} {}", c.column_name, t.to_ddl())))
            .collect();

        // send the values down
        let send_query = QueryText::from(format!("SELECT {} FROM {}", names.join(", "), leaf.target_table));
        let mut send_sources = self.producing_detail().consumer_nodes.clone();
        if send_sources.is_empty() {
            send_sources = all.clone();
        }
        let mut send = ExecutionStep::synthetic(
            send_query,
            &send_sources,
            columns.clone(),
            vec![leaf.target_table.clone()],
            Some((send_table, ctx.config.temp_table_statement(send_table, &ddl_columns))),
        );
        send.is_correlated_aux = true;
        send.node_detail.is_consumer = true;
        send.node_detail.suppress_send_node_id = true;
        let hashed = leaf
            .child_correlated_hashable
            .as_deref()
            .and_then(|c| names.iter().position(|n| n.eq_ignore_ascii_case(c)));
        let send_destination = match hashed {
            Some(pos) => {
                let key_type = columns[pos].ty.unwrap_or_else(ExpressionType::text);
                Destination::Hash(HashDestination::single(pos, Arc::new(HashPartitionMap::new(&all)), key_type))
            }
            None => Destination::Broadcast,
        };
        send.apply_destination(send_destination, &all, coordinator);

        // compact on each node, rows stay where they are
        let mut compact_query = QueryText::from(format!("SELECT DISTINCT {}, ", names.join(", ")));
        compact_query.push_node_id().push_str(&format!(" AS {} FROM {}", XNODEID_COLUMN, send_table));
        let mut compact_columns = columns;
        compact_columns.push(Projection {
            column_name: XNODEID_COLUMN.to_string(),
            expression: QueryText::new(),
            ty: Some(ExpressionType::int()),
        });
        let mut compact_ddl = ddl_columns;
        compact_ddl.push(format!("{} {}", XNODEID_COLUMN, ExpressionType::int().to_ddl()));
        let xnodeid = compact_columns.len() - 1;
        let mut compact = ExecutionStep::synthetic(
            compact_query,
            &all,
            compact_columns,
            vec![send_table.to_string()],
            Some((down_table, ctx.config.temp_table_statement(down_table, &compact_ddl))),
        );
        compact.is_correlated_aux = true;
        compact.xnodeid_position = Some(xnodeid);
        compact.node_detail.is_consumer = true;
        compact.node_detail.add_drop(send_table);
        compact.apply_destination(Destination::NodeIdColumn { position: xnodeid }, &all, coordinator);

        Ok(vec![send, compact])
    }

    /// First step of an outer-join branch: rows return to the node that
    /// produced them.
    pub fn outer_first_step(first: &ExecutionStep, coordinator: NodeId) -> ExecutionStep {
        let mut step = first.clone();
        let destination = match step.xnodeid_position {
            Some(position) => Destination::NodeIdColumn { position },
            None => Destination::Broadcast,
        };
        let downstream = step.producing_detail().producer_nodes.clone();
        step.is_outer_step = true;
        step.apply_destination(destination, &downstream, coordinator);
        step
    }

    /// Same step, hashed over every database node on its output columns
    /// instead of funneling through the coordinator.
    pub fn convert_to_node_step(&self, ctx: &CompileContext) -> ExecutionStep {
        let mut step = self.clone();
        let all = ctx.db_nodes();
        let width = step.projections.len().min(ctx.config.max_group_hash_count.max(1));
        let destination = if width == 0 {
            Destination::Broadcast
        } else {
            let positions: Vec<usize> = (0..width).collect();
            let key_types = key_types_of(&step.projections, &positions);
            Destination::Hash(HashDestination::composite(positions, Arc::new(HashPartitionMap::new(&all)), key_types))
        };
        step.apply_destination(destination, &all, ctx.coordinator());
        step
    }

    /// Destination this step should have given the step that reads its
    /// output, or `None` when it is already right.
    pub fn corrected_destination(&self, next: &ExecutionStep, relation_join: bool, coordinator: NodeId) -> Option<Destination> {
        let produced = self.target_table()?;
        if !relation_join && !next.reads_table(produced) {
            return None;
        }
        let current = self.destination();
        let at_coordinator = current.is_coordinator() || *current == Destination::SingleNode(coordinator);

        if next.runs_on_coordinator() {
            return (!at_coordinator).then_some(Destination::Coordinator);
        }
        if next.node_detail.is_producer {
            if let [only] = next.node_detail.producer_nodes.as_slice() {
                return (*current != Destination::SingleNode(*only)).then_some(Destination::SingleNode(*only));
            }
            if current.is_coordinator() {
                return Some(Destination::Broadcast);
            }
        }
        None
    }

    /// Apply [`ExecutionStep::corrected_destination`] against `next`.
    pub fn correct_destination(&mut self, next: &ExecutionStep, relation_join: bool, coordinator: NodeId) -> bool {
        let Some(destination) = self.corrected_destination(next, relation_join, coordinator) else {
            return false;
        };
        debug!(
            leaf = self.leaf_id,
            from = self.destination().name(),
            to = destination.name(),
            "destination corrected"
        );
        let downstream = if next.runs_on_coordinator() {
            vec![coordinator]
        } else {
            next.node_detail.producer_nodes.clone()
        };
        self.apply_destination(destination, &downstream, coordinator);
        true
    }

    pub fn explain(&self) -> Value {
        let usage: Vec<Value> = self.node_usage.values().map(|u| json!(u)).collect();
        json!({
            "leaf": self.leaf_id,
            "nodes": self.node_detail.explain(),
            "coordinator": self.coord_detail.as_ref().map(StepDetail::explain),
            "usage": usage,
            "final": self.is_final_step,
            "extra": self.is_extra_step,
            "outer": self.is_outer_step,
            "correlated_aux": self.is_correlated_aux,
            "correlated_subplan": self.correlated_subplan.map(|p| p.0),
            "outer_subplan": self.outer_subplan.map(|p| p.0),
            "uncorrelated_subplans": self.uncorrelated_subplans.iter().map(|p| p.0).collect::<Vec<_>>(),
        })
    }
}
