use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    database::{normalize_node_list, ExpressionType, HashPartitionMap, NodeId, PartitionScheme},
    planner::{CompileContext, Destination, HashDestination, Leaf, Projection, QueryText},
};

/// Union result group of a step that is not part of a union.
pub const NO_UNION_GROUP: u8 = 0;

/// One side (node or coordinator) of an execution step.
#[derive(Debug, Clone)]
pub struct StepDetail {
    pub is_producer: bool,
    pub is_consumer: bool,
    /// Statement run by the producers; may hold parameter and node slots.
    pub query: QueryText,
    /// Statement as compiled, before prepared-parameter binding.
    pub template: Option<QueryText>,
    /// Nodes running `query`.
    pub producer_nodes: Vec<NodeId>,
    pub target_table: Option<String>,
    pub target_ddl: Option<String>,
    /// Temp tables to drop once the step has run.
    pub drop_list: Vec<String>,
    pub destination: Destination,
    pub consumer_nodes: Vec<NodeId>,
    /// Rows of a correlated send-down carry no producing node tag.
    pub suppress_send_node_id: bool,
    /// Position of the outer-join row identity column.
    pub serial_column_position: Option<usize>,
    /// 0 outside unions, 1 dedupe group, 2 append group.
    pub union_result_group: u8,
    /// Node results are stream-merged at the coordinator, not materialized.
    pub combine_results: bool,
    /// Bulk-load the target table.
    pub use_load: bool,
}

impl StepDetail {
    /// A side that does nothing.
    pub fn idle() -> Self {
        Self {
            is_producer: false,
            is_consumer: false,
            query: QueryText::new(),
            template: None,
            producer_nodes: Vec::new(),
            target_table: None,
            target_ddl: None,
            drop_list: Vec::new(),
            destination: Destination::Coordinator,
            consumer_nodes: Vec::new(),
            suppress_send_node_id: false,
            serial_column_position: None,
            union_result_group: NO_UNION_GROUP,
            combine_results: false,
            use_load: false,
        }
    }

    /// A side running `query` on `nodes`.
    pub fn producer(query: QueryText, nodes: &[NodeId]) -> Self {
        let mut producer_nodes = nodes.to_vec();
        normalize_node_list(&mut producer_nodes);
        Self { is_producer: true, query, producer_nodes, ..Self::idle() }
    }

    pub fn set_target(&mut self, table: &str, ddl: Option<String>) {
        self.target_table = Some(table.to_string());
        self.target_ddl = ddl;
    }

    pub fn clear_target(&mut self) {
        self.target_table = None;
        self.target_ddl = None;
    }

    /// Set the destination and derive the consumers from it.
    pub fn set_destination(&mut self, destination: Destination, downstream: &[NodeId], coordinator: NodeId) {
        self.consumer_nodes = destination.consumers(downstream, coordinator);
        self.destination = destination;
    }

    pub fn add_drop(&mut self, table: &str) {
        if !self.drop_list.iter().any(|t| t.eq_ignore_ascii_case(table)) {
            self.drop_list.push(table.to_string());
        }
    }

    /// Decide where this side's rows go, from what the next leaves need.
    ///
    /// `streams_final` marks the last step of a top-level plan that streams
    /// its result to the client.
    pub fn update_producer_step_info(
        &mut self,
        current: &Leaf,
        next: Option<&Leaf>,
        next_next: Option<&Leaf>,
        ctx: &CompileContext,
        streams_final: bool,
    ) {
        let destination = producer_destination(current, next, next_next, ctx, streams_final);
        let downstream = match next {
            Some(leaf) if leaf.runs_on_coordinator => vec![ctx.coordinator()],
            Some(leaf) => ctx.nodes_or_all(&leaf.query_node_list),
            None => Vec::new(),
        };
        debug!(leaf = current.leaf_id, destination = destination.name(), "producer destination");
        self.set_destination(destination, &downstream, ctx.coordinator());
        self.use_load = ctx.config.use_load_for_step && next.is_some();
    }

    pub fn explain(&self) -> Value {
        json!({
            "producer": self.is_producer,
            "consumer": self.is_consumer,
            "query": self.query.to_string(),
            "producers": self.producer_nodes,
            "target": self.target_table,
            "drop": self.drop_list,
            "destination": self.destination.explain(),
            "consumers": self.consumer_nodes,
            "union_group": self.union_result_group,
            "combine_results": self.combine_results,
        })
    }
}

/// Destination choice, in priority order:
/// end of plan, correlated next leaf, outer-join extra step, combiner,
/// coordinator combine, then the partitioning of the next driving table.
pub fn producer_destination(
    current: &Leaf,
    next: Option<&Leaf>,
    next_next: Option<&Leaf>,
    ctx: &CompileContext,
    streams_final: bool,
) -> Destination {
    let Some(next) = next else {
        return if streams_final { Destination::CoordinatorFinal } else { Destination::Coordinator };
    };
    if next.subplan.is_some() {
        return Destination::Coordinator;
    }
    if next_next.is_some_and(|l| l.is_extra_step) {
        return Destination::BroadcastAndCoordinator;
    }
    if next.is_combiner {
        return group_hash_destination(current, next, ctx).unwrap_or(Destination::Coordinator);
    }
    if next.is_coordinator_combine || next.runs_on_coordinator {
        return Destination::Coordinator;
    }
    driving_table_destination(current, next, ctx)
}

/// Re-hash partial aggregates by the real group keys, capped in width.
fn group_hash_destination(current: &Leaf, next: &Leaf, ctx: &CompileContext) -> Option<Destination> {
    let positions: Vec<usize> = next
        .real_group_keys()
        .filter_map(|g| g.column.as_deref())
        .filter_map(|c| current.projection_position(c))
        .take(ctx.config.max_group_hash_count.max(1))
        .collect();
    if positions.is_empty() {
        return None;
    }
    let nodes = ctx.nodes_or_all(&next.query_node_list);
    let map = Arc::new(HashPartitionMap::new(&nodes));
    let key_types = key_types_of(&current.projections, &positions);
    Some(Destination::Hash(HashDestination::composite(positions, map, key_types)))
}

fn driving_table_destination(current: &Leaf, next: &Leaf, ctx: &CompileContext) -> Destination {
    let Some(name) = next.driving_table() else {
        return correlated_or_broadcast(current, next, ctx);
    };
    let Some(table) = ctx.table(name) else {
        warn!(table = name, leaf = next.leaf_id, "driving table not in catalog, broadcasting");
        return correlated_or_broadcast(current, next, ctx);
    };

    match table.partition_scheme {
        PartitionScheme::Hash => {
            let column = next.hash_column.as_deref().or(table.partitioned_column.as_deref());
            if let Some(pos) = column.and_then(|c| current.projection_position(c)) {
                let key_type = table
                    .partitioned_column_type()
                    .or_else(|| current.projections[pos].ty)
                    .unwrap_or_else(ExpressionType::text);
                return Destination::Hash(HashDestination::single(pos, Arc::clone(&table.partition_map), key_type));
            }
            correlated_or_broadcast(current, next, ctx)
        }
        PartitionScheme::One => match table.partition_map.all_partitions().first() {
            Some(&node) => Destination::SingleNode(node),
            None => Destination::Broadcast,
        },
        PartitionScheme::Lookup => Destination::SingleNode(ctx.coordinator()),
        PartitionScheme::Robin => correlated_or_broadcast(current, next, ctx),
    }
}

fn correlated_or_broadcast(current: &Leaf, next: &Leaf, ctx: &CompileContext) -> Destination {
    if next.is_single_step_correlated {
        if let Some(pos) = next.hash_column.as_deref().and_then(|c| current.projection_position(c)) {
            let nodes = ctx.nodes_or_all(&next.query_node_list);
            let key_type = current.projections[pos].ty.unwrap_or_else(ExpressionType::text);
            return Destination::Hash(HashDestination::single(pos, Arc::new(HashPartitionMap::new(&nodes)), key_type));
        }
    }
    Destination::Broadcast
}

/// Key types of a hash over `positions`, each column by its own projected
/// type; untyped columns hash as text.
pub(crate) fn key_types_of(projections: &[Projection], positions: &[usize]) -> Vec<ExpressionType> {
    positions
        .iter()
        .map(|&p| projections.get(p).and_then(|pr| pr.ty).unwrap_or_else(ExpressionType::text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::PlannerConfig;
    use crate::planner::{fixtures, GroupKey, QueryPlan};

    fn leaf_projecting(id: usize, columns: &[&str]) -> Leaf {
        let mut leaf = Leaf::new(id, &format!("TMP{id}")).with_nodes(&[1, 2, 3, 4]);
        for c in columns {
            leaf.append_projection(c, format!("o.{c}"), Some(ExpressionType::int()), false).unwrap();
        }
        leaf
    }

    fn decide(current: &Leaf, next: Option<&Leaf>, next_next: Option<&Leaf>, config: &PlannerConfig) -> Destination {
        let catalog = fixtures::catalog();
        let ctx = CompileContext::new(&catalog, config);
        producer_destination(current, next, next_next, &ctx, true)
    }

    #[test]
    fn last_leaf_goes_to_coordinator() {
        let config = PlannerConfig::default();
        let catalog = fixtures::catalog();
        let ctx = CompileContext::new(&catalog, &config);
        let leaf = leaf_projecting(1, &["a"]);
        assert_eq!(producer_destination(&leaf, None, None, &ctx, true), Destination::CoordinatorFinal);
        assert_eq!(producer_destination(&leaf, None, None, &ctx, false), Destination::Coordinator);
    }

    #[test]
    fn correlated_next_leaf_centralizes() {
        let mut next = leaf_projecting(2, &["a"]);
        next.subplan = Some(Box::new(QueryPlan::new(vec![leaf_projecting(9, &["a"])])));
        let dest = decide(&leaf_projecting(1, &["a"]), Some(&next), None, &PlannerConfig::default());
        assert_eq!(dest, Destination::Coordinator);
    }

    #[test]
    fn extra_step_after_next_needs_both_copies() {
        let mut extra = leaf_projecting(3, &["a"]);
        extra.is_extra_step = true;
        let dest = decide(&leaf_projecting(1, &["a"]), Some(&leaf_projecting(2, &["a"])), Some(&extra), &PlannerConfig::default());
        assert_eq!(dest, Destination::BroadcastAndCoordinator);
    }

    #[test]
    fn combiner_hashes_on_group_keys_capped() {
        let current = leaf_projecting(1, &["a", "b", "c", "d"]);
        let mut next = leaf_projecting(2, &["a"]);
        next.is_combiner = true;
        for c in ["a", "b", "c", "d"] {
            next.group_by.push(GroupKey::column(c, format!("TMP1.{c}")));
        }
        next.group_by.push(GroupKey { synthetic: true, ..GroupKey::column("d", "TMP1.d") });
        let config = PlannerConfig { max_group_hash_count: 3, ..PlannerConfig::default() };
        match decide(&current, Some(&next), None, &config) {
            Destination::Hash(h) => assert_eq!(h.columns, vec![0, 1, 2]),
            other => panic!("expected hash, got {other:?}"),
        }
    }

    #[test]
    fn scalar_combiner_centralizes() {
        let mut next = leaf_projecting(2, &["a"]);
        next.is_combiner = true;
        let dest = decide(&leaf_projecting(1, &["a"]), Some(&next), None, &PlannerConfig::default());
        assert_eq!(dest, Destination::Coordinator);
    }

    #[test]
    fn driving_table_scheme_decides() {
        let current = leaf_projecting(1, &["customer_id", "region_id"]);
        let config = PlannerConfig::default();

        let next = leaf_projecting(2, &["x"]).with_table("orders");
        match decide(&current, Some(&next), None, &config) {
            Destination::Hash(h) => {
                assert_eq!(h.columns, vec![0]);
                assert_eq!(h.key_types, vec![ExpressionType::int()]);
            }
            other => panic!("expected hash, got {other:?}"),
        }

        let next = leaf_projecting(2, &["x"]).with_table("single_t");
        assert_eq!(decide(&current, Some(&next), None, &config), Destination::SingleNode(fixtures::SINGLE_NODE));

        let next = leaf_projecting(2, &["x"]).with_table("lookup_region");
        assert_eq!(decide(&current, Some(&next), None, &config), Destination::SingleNode(fixtures::COORDINATOR));

        let next = leaf_projecting(2, &["x"]).with_table("robin_t");
        assert_eq!(decide(&current, Some(&next), None, &config), Destination::Broadcast);

        let next = leaf_projecting(2, &["x"]).with_table("some_view");
        assert_eq!(decide(&current, Some(&next), None, &config), Destination::Broadcast);
    }

    #[test]
    fn hash_table_without_projected_key_broadcasts() {
        let current = leaf_projecting(1, &["region_id"]);
        let next = leaf_projecting(2, &["x"]).with_table("orders");
        assert_eq!(decide(&current, Some(&next), None, &PlannerConfig::default()), Destination::Broadcast);
    }

    #[test]
    fn single_step_correlated_uses_hash_column() {
        let current = leaf_projecting(1, &["k"]);
        let mut next = leaf_projecting(2, &["x"]);
        next.is_single_step_correlated = true;
        next.hash_column = Some("k".into());
        assert!(matches!(decide(&current, Some(&next), None, &PlannerConfig::default()), Destination::Hash(_)));
    }

    #[test]
    fn consumers_follow_destination() {
        let config = PlannerConfig::default();
        let catalog = fixtures::catalog();
        let ctx = CompileContext::new(&catalog, &config);
        let current = leaf_projecting(1, &["a"]);
        let mut next = leaf_projecting(2, &["a"]).with_table("robin_t");
        next.query_node_list = vec![2, 3];
        let mut detail = StepDetail::producer(QueryText::from("SELECT 1"), &[4, 1]);
        detail.update_producer_step_info(&current, Some(&next), None, &ctx, false);
        assert_eq!(detail.producer_nodes, vec![1, 4]);
        assert_eq!(detail.consumer_nodes, vec![2, 3]);
        assert!(detail.use_load);
    }
}
