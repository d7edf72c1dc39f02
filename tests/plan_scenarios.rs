mod common;

use std::collections::HashMap;

use common::{catalog, scan, COORDINATOR, NODES};
use stepplan::database::{ExpressionType, PlannerConfig};
use stepplan::planner::{
    Bindings, Destination, FromRelation, GroupKey, JoinCondition, Leaf, LeafKind, PlanTree, PlannerError, PreparedHandler,
    QueryPlan, QueryText, UnionBranch, UnionType,
};

fn render(q: &QueryText) -> String {
    q.render(&Bindings::default()).unwrap()
}

/// orders joined with lookup_region, partially grouped on every node, then
/// combined by region.
fn grouped_by_region(limit: Option<u64>) -> QueryPlan {
    let mut partial = Leaf::new(1, "TMP1")
        .with_table("orders")
        .with_nodes(&NODES)
        .with_from(FromRelation::new("orders", "o"))
        .with_from(FromRelation::new("lookup_region", "l"))
        .with_join(JoinCondition::new("o.region_id = l.region_id", &["o", "l"]));
    partial.append_projection("region_id", "o.region_id", Some(ExpressionType::int()), false).unwrap();
    partial.append_projection("partial", "SUM(o.amount)", Some(ExpressionType::numeric(12, 2)), false).unwrap();
    partial.group_by.push(GroupKey::column("region_id", "o.region_id"));

    let mut combiner = Leaf::new(2, "TMP2").with_nodes(&NODES).with_from(FromRelation::new("TMP1", "TMP1"));
    combiner.is_combiner = true;
    combiner.append_projection("region_id", "TMP1.region_id", Some(ExpressionType::int()), true).unwrap();
    combiner.append_projection("total", "SUM(TMP1.partial)", Some(ExpressionType::numeric(12, 2)), true).unwrap();
    combiner.group_by.push(GroupKey::column("region_id", "TMP1.region_id"));

    let mut query = QueryPlan::top_level(vec![partial, combiner]);
    query.limit = limit;
    query
}

#[test]
fn grouped_join_hashes_to_combiner_and_streams_with_limit() {
    let tree = PlanTree::compile(grouped_by_region(Some(10)), &catalog(), &PlannerConfig::default()).unwrap();
    let root = tree.root();
    assert_eq!(root.steps.len(), 2);

    let first = &root.steps[0];
    assert_eq!(first.node_detail.producer_nodes, NODES.to_vec());
    match first.destination() {
        Destination::Hash(h) => assert_eq!(h.columns, vec![0]),
        other => panic!("expected hash on region_id, got {other:?}"),
    }
    let sql = render(&first.node_detail.query);
    assert!(sql.contains("lookup_region l"), "{sql}");
    assert!(sql.contains("o.region_id = l.region_id"), "{sql}");

    let last = &root.steps[1];
    assert_eq!(*last.destination(), Destination::CoordinatorFinal);
    assert!(last.is_final_step);
    assert!(last.producing_detail().combine_results);
    assert_eq!(last.producer_count(), 4);
    let sql = render(&last.node_detail.query);
    assert!(sql.ends_with(" LIMIT 10"), "{sql}");
    assert!(!sql.contains("OFFSET"), "{sql}");
    assert_eq!(root.merge_limit, Some(10));
    assert_eq!(root.merge_offset, None);
}

#[test]
fn each_produced_table_has_one_destination() {
    let tree = PlanTree::compile(grouped_by_region(None), &catalog(), &PlannerConfig::default()).unwrap();
    let mut claimed: HashMap<String, Destination> = HashMap::new();
    for step in tree.steps() {
        let Some(table) = step.target_table() else { continue };
        if let Some(previous) = claimed.insert(table.to_ascii_lowercase(), step.destination().clone()) {
            assert_eq!(&previous, step.destination(), "{table} claimed twice");
        }
    }
    assert!(claimed.contains_key("tmp1"));
}

#[test]
fn hash_destination_routes_the_same_value_to_the_same_node() {
    let tree = PlanTree::compile(grouped_by_region(None), &catalog(), &PlannerConfig::default()).unwrap();
    let Destination::Hash(hash) = tree.root().steps[0].destination().clone() else {
        panic!("expected hash destination");
    };
    let row = vec![Some("0042".to_string()), Some("10.50".to_string())];
    let first = hash.route(&row);
    assert_eq!(first.len(), 1);
    for _ in 0..10 {
        assert_eq!(hash.route(&row), first);
    }
    assert_eq!(hash.route(&[Some("42".to_string())]), first);
}

#[test]
fn offset_over_many_nodes_is_left_to_the_merge() {
    let mut query = QueryPlan::top_level(vec![scan(1, "orders", &["order_id", "amount"])]);
    query.limit = Some(10);
    query.offset = Some(5);
    let tree = PlanTree::compile(query, &catalog(), &PlannerConfig::default()).unwrap();
    let sql = render(&tree.root().steps[0].node_detail.query);
    assert!(sql.ends_with(" LIMIT 15"), "{sql}");
    assert!(!sql.contains("OFFSET"));
    assert_eq!((tree.root().merge_limit, tree.root().merge_offset), (Some(10), Some(5)));
}

#[test]
fn union_then_union_all_tags_dedupe_and_append_groups() {
    let branch = |id| UnionBranch { union_type: UnionType::Union, plan: QueryPlan::new(vec![scan(id, "orders", &["order_id"])]) };
    let mut query = QueryPlan { is_top_level: true, ..QueryPlan::default() };
    query.union_branches = vec![
        branch(1),
        branch(2),
        UnionBranch { union_type: UnionType::UnionAll, ..branch(3) },
    ];
    let tree = PlanTree::compile(query, &catalog(), &PlannerConfig::default()).unwrap();
    let groups: Vec<u8> = tree
        .root()
        .union_children
        .iter()
        .map(|id| tree.plan(*id).unwrap().union_result_group())
        .collect();
    assert_eq!(groups, vec![1, 1, 2]);
    for id in &tree.root().union_children {
        let last = tree.plan(*id).unwrap().last_step().unwrap();
        assert_eq!(last.producing_detail().union_result_group, tree.plan(*id).unwrap().union_result_group());
        assert_eq!(*last.destination(), Destination::CoordinatorFinal);
    }
}

#[test]
fn union_branch_keeps_its_own_window() {
    let mut limited = QueryPlan::new(vec![scan(1, "orders", &["order_id"])]);
    limited.limit = Some(5);
    let mut query = QueryPlan { is_top_level: true, ..QueryPlan::default() };
    query.union_branches = vec![
        UnionBranch { union_type: UnionType::UnionAll, plan: limited },
        UnionBranch { union_type: UnionType::UnionAll, plan: QueryPlan::new(vec![scan(2, "orders", &["order_id"])]) },
    ];
    let tree = PlanTree::compile(query, &catalog(), &PlannerConfig::default()).unwrap();

    let branch = tree.plan(tree.root().union_children[0]).unwrap();
    let last = branch.last_step().unwrap();
    assert!(last.runs_on_coordinator());
    assert_eq!(last.producer_count(), 1);
    let sql = render(&last.producing_detail().query);
    assert!(sql.ends_with(" LIMIT 5"), "{sql}");
    assert_eq!(branch.steps[0].node_detail.producer_nodes, NODES.to_vec());
    assert_eq!(tree.root().merge_limit, None);
}

#[test]
fn prepared_reset_returns_routing_to_compiled_nodes() {
    let mut leaf = scan(1, "orders", &["order_id", "customer_id"]);
    let mut cond = QueryText::from("o.customer_id = ");
    cond.push_param(1);
    leaf.conditions.push(cond);
    leaf.partition_parameter = Some(1);
    let mut tree = PlanTree::compile(QueryPlan::top_level(vec![leaf]), &catalog(), &PlannerConfig::default()).unwrap();

    let handler = PreparedHandler::prepare_parameters(&mut tree, &catalog(), &[ExpressionType::int()]).unwrap();
    handler.substitute_parameter_values(&mut tree, &[Some("7".into())]).unwrap();
    assert_eq!(tree.root().steps[0].producer_count(), 1);
    handler.reset(&mut tree);
    assert_eq!(tree.root().steps[0].node_detail.producer_nodes, NODES.to_vec());
    assert!(tree.root().steps[0].node_detail.query.params().contains(&1));
}

#[test]
fn outer_join_without_row_identity_fails_to_compile() {
    let mut leaf = scan(1, "nokey_t", &["a", "b"]);
    leaf.outer_subplan = Some(Box::new(QueryPlan::new(vec![scan(2, "customers", &["customer_id"])])));
    let err = PlanTree::compile(QueryPlan::top_level(vec![leaf.clone()]), &catalog(), &PlannerConfig::default())
        .unwrap_err();
    assert_eq!(err, PlannerError::NoOuterJoinIdentity { table: "nokey_t".into() });

    let config = PlannerConfig { use_oid_in_outer: true, ..PlannerConfig::default() };
    let tree = PlanTree::compile(QueryPlan::top_level(vec![leaf]), &catalog(), &config).unwrap();
    assert!(tree.root().steps[0].projection_position("XOUTERID_n_oid").is_some());
}

#[test]
fn outer_branch_returns_rows_to_their_node_and_fills_node_count() {
    let mut leaf = scan(1, "orders", &["order_id", "customer_id"]);
    let mut cond = QueryText::from("o.customer_id > ");
    cond.push_node_count();
    leaf.conditions.push(cond);
    leaf.outer_subplan = Some(Box::new(QueryPlan::new(vec![scan(2, "customers", &["customer_id"])])));
    let tree = PlanTree::compile(QueryPlan::top_level(vec![leaf]), &catalog(), &PlannerConfig::default()).unwrap();

    let step = &tree.root().steps[0];
    assert!(step.projection_position("XOUTERID_o_order_id").is_some());
    assert!(!step.node_detail.query.has_node_count());
    assert!(render(&step.node_detail.query).contains("o.customer_id > 4"));

    let outer = tree.plan(step.outer_subplan.unwrap()).unwrap();
    let first = &outer.steps[0];
    assert!(first.is_outer_step);
    assert!(matches!(first.destination(), Destination::NodeIdColumn { .. }));
}

#[test]
fn correlated_subquery_hashes_back_and_sends_values_down() {
    let mut feeder = scan(1, "orders", &["order_id", "customer_id"]);
    feeder.child_correlated_hashable = Some("customer_id".into());
    feeder.parent_correlated_columns = vec!["customer_id".into()];
    feeder.kind = LeafKind::SubqueryDataDown;
    feeder.correlated_down_table = Some("XDOWN1".into());

    let mut child = scan(3, "customers", &["customer_id", "name"]);
    child.conditions.push(QueryText::from("c.customer_id = XDOWN1.customer_id"));

    let mut parent = Leaf::new(2, "TMP2").with_nodes(&NODES).with_from(FromRelation::new("TMP1", "TMP1"));
    parent.append_projection("order_id", "TMP1.order_id", Some(ExpressionType::bigint()), true).unwrap();
    parent.child_correlated_hashable = Some("customer_id".into());
    parent.subplan = Some(Box::new(QueryPlan::new(vec![child])));

    let tree =
        PlanTree::compile(QueryPlan::top_level(vec![feeder, parent]), &catalog(), &PlannerConfig::default()).unwrap();
    let root = tree.root();
    assert_eq!(root.steps.len(), 4);

    let (send, compact) = (&root.steps[1], &root.steps[2]);
    assert!(send.is_correlated_aux && compact.is_correlated_aux);
    assert!(matches!(send.destination(), Destination::Hash(_)));
    assert_eq!(compact.target_table(), Some("XDOWN1"));
    assert!(matches!(compact.destination(), Destination::NodeIdColumn { position: 1 }));
    assert!(compact.node_detail.query.has_node_id());

    let last = &root.steps[3];
    assert_eq!(last.node_detail.producer_nodes, NODES.to_vec());
    assert_eq!(*last.destination(), Destination::CoordinatorFinal);
    let sub = tree.plan(last.correlated_subplan.unwrap()).unwrap();
    match sub.last_step().unwrap().destination() {
        Destination::Hash(h) => assert_eq!(h.columns, vec![0]),
        other => panic!("expected hash back to the parent, got {other:?}"),
    }
}

#[test]
fn prepared_values_rebind_without_recompiling() {
    let build = || {
        let mut leaf = scan(1, "orders", &["order_id", "customer_id"]);
        let mut cond = QueryText::from("o.customer_id = ");
        cond.push_param(1);
        leaf.conditions.push(cond);
        leaf.partition_parameter = Some(1);
        PlanTree::compile(QueryPlan::top_level(vec![leaf]), &catalog(), &PlannerConfig::default()).unwrap()
    };
    let types = [ExpressionType::int()];
    let catalog = catalog();

    let mut reused = build();
    let handler = PreparedHandler::prepare_parameters(&mut reused, &catalog, &types).unwrap();
    handler.substitute_parameter_values(&mut reused, &[Some("11".into())]).unwrap();
    handler.substitute_parameter_values(&mut reused, &[Some("12".into())]).unwrap();

    let mut fresh = build();
    let handler = PreparedHandler::prepare_parameters(&mut fresh, &catalog, &types).unwrap();
    handler.substitute_parameter_values(&mut fresh, &[Some("12".into())]).unwrap();

    let step = |t: &PlanTree| t.root().steps[0].clone();
    assert_eq!(render(&step(&reused).node_detail.query), render(&step(&fresh).node_detail.query));
    assert_eq!(step(&reused).node_detail.producer_nodes, step(&fresh).node_detail.producer_nodes);
    assert_eq!(step(&fresh).producer_count(), 1);

    let err = handler.substitute_parameter_values(&mut fresh, &[]).unwrap_err();
    assert_eq!(err, PlannerError::ParameterOutOfRange { index: 1, supplied: 0 });
}

#[test]
fn explain_reports_coordinator_and_every_step() {
    let tree = PlanTree::compile(grouped_by_region(Some(10)), &catalog(), &PlannerConfig::default()).unwrap();
    let explained = tree.explain();
    assert_eq!(explained["coordinator"], COORDINATOR);
    assert_eq!(explained["plans"][0]["steps"].as_array().unwrap().len(), 2);
}
