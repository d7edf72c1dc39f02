mod common;

use common::{catalog, scan, COORDINATOR, NODES};
use serde_json::{json, Value};
use stepplan::database::{MergeConfig, PlannerConfig};
use stepplan::executor::{CombinedResultSet, MemoryResultSet, MergeError, MergeSpec, NodeStream, Row};
use stepplan::planner::{Bindings, OrderKey, PlanTree, QueryPlan, UnionBranch, UnionType};

fn rows(values: &[i64]) -> Vec<Row> {
    values.iter().map(|v| Row::new(vec![json!(v)])).collect()
}

fn firsts(rows: &[Row]) -> Vec<Value> {
    rows.iter().map(|r| r.values()[0].clone()).collect()
}

#[tokio::test]
async fn window_pushed_to_nodes_is_trimmed_once_by_the_merge() {
    let mut query = QueryPlan::top_level(vec![scan(1, "orders", &["order_id"])]);
    query.order_by = vec![OrderKey { position: 1, descending: false }];
    query.limit = Some(3);
    query.offset = Some(2);
    let tree = PlanTree::compile(query, &catalog(), &PlannerConfig::default()).unwrap();
    let spec = MergeSpec::for_tree(&tree);
    assert!(spec.is_streaming());

    // every node honours LIMIT 5, the pushed-down limit + offset
    let input = &spec.inputs[0];
    let streams: Vec<NodeStream> = input
        .nodes
        .iter()
        .map(|&node| {
            let base = i64::from(node);
            let values: Vec<i64> = (0..5).map(|i| base + i * 4).collect();
            NodeStream::new(MemoryResultSet::new(node, rows(&values)), input.union_group)
        })
        .collect();
    let merged = CombinedResultSet::open(streams, &spec, &MergeConfig::default()).collect().await.unwrap();
    assert_eq!(firsts(&merged), vec![json!(3), json!(4), json!(5)]);
}

#[tokio::test]
async fn union_branches_merge_by_result_group() {
    let branch = |id, union_type| UnionBranch { union_type, plan: QueryPlan::new(vec![scan(id, "orders", &["order_id"])]) };
    let mut query = QueryPlan { is_top_level: true, ..QueryPlan::default() };
    query.union_branches = vec![
        branch(1, UnionType::Union),
        branch(2, UnionType::Union),
        branch(3, UnionType::UnionAll),
    ];
    query.order_by = vec![OrderKey { position: 1, descending: false }];
    let tree = PlanTree::compile(query, &catalog(), &PlannerConfig::default()).unwrap();
    let spec = MergeSpec::for_tree(&tree);
    let groups: Vec<u8> = spec.inputs.iter().map(|i| i.union_group).collect();
    assert_eq!(groups, vec![1, 1, 2]);

    // A and B overlap on 2, C repeats 3
    let data = [vec![1, 2], vec![2, 3], vec![3, 3]];
    let streams: Vec<NodeStream> = spec
        .inputs
        .iter()
        .zip(data)
        .map(|(input, values)| NodeStream::new(MemoryResultSet::new(input.nodes[0], rows(&values)), input.union_group))
        .collect();
    let merged = CombinedResultSet::open(streams, &spec, &MergeConfig::default()).collect().await.unwrap();
    assert_eq!(firsts(&merged), vec![json!(1), json!(2), json!(3), json!(3), json!(3)]);
}

#[tokio::test]
async fn ordered_union_with_a_windowed_branch_merges_in_order() {
    // (SELECT order_id FROM orders ORDER BY 1 LIMIT 2) UNION ALL (SELECT order_id FROM orders)
    // ORDER BY 1 LIMIT 3 OFFSET 1
    let mut windowed = QueryPlan::new(vec![scan(1, "orders", &["order_id"])]);
    windowed.order_by = vec![OrderKey { position: 1, descending: false }];
    windowed.limit = Some(2);
    let plain = QueryPlan::new(vec![scan(2, "orders", &["order_id"])]);
    let mut query = QueryPlan { is_top_level: true, ..QueryPlan::default() };
    query.union_branches = vec![
        UnionBranch { union_type: UnionType::UnionAll, plan: windowed },
        UnionBranch { union_type: UnionType::UnionAll, plan: plain },
    ];
    query.order_by = vec![OrderKey { position: 1, descending: false }];
    query.limit = Some(3);
    query.offset = Some(1);
    let tree = PlanTree::compile(query, &catalog(), &PlannerConfig::default()).unwrap();

    let plain_sql = tree.plan(tree.root().union_children[1]).unwrap().last_step().unwrap().node_detail.query.clone();
    assert!(plain_sql.render(&Bindings::default()).unwrap().ends_with(" ORDER BY 1"));

    let spec = MergeSpec::for_tree(&tree);
    assert_eq!((spec.offset, spec.limit), (Some(1), Some(3)));
    assert_eq!(spec.inputs[0].nodes, vec![COORDINATOR]);
    assert_eq!(spec.inputs[1].nodes, NODES.to_vec());

    // the coordinator returns the windowed branch, each node its sorted share
    let mut streams = vec![NodeStream::new(MemoryResultSet::new(COORDINATOR, rows(&[2, 7])), spec.inputs[0].union_group)];
    for (node, values) in NODES.iter().zip([vec![1, 5], vec![3], vec![6], vec![4, 8]]) {
        streams.push(NodeStream::new(MemoryResultSet::new(*node, rows(&values)), spec.inputs[1].union_group));
    }
    let merged = CombinedResultSet::open(streams, &spec, &MergeConfig::default()).collect().await.unwrap();
    assert_eq!(firsts(&merged), vec![json!(2), json!(3), json!(4)]);
}

#[tokio::test]
async fn failing_node_surfaces_instead_of_truncating() {
    let tree =
        PlanTree::compile(QueryPlan::top_level(vec![scan(1, "orders", &["order_id"])]), &catalog(), &PlannerConfig::default())
            .unwrap();
    let spec = MergeSpec::for_tree(&tree);
    let streams: Vec<NodeStream> = NODES
        .iter()
        .map(|&node| {
            let source = MemoryResultSet::new(node, rows(&[1, 2, 3]));
            let source = if node == 3 { source.failing_after(2, "connection reset by peer") } else { source };
            NodeStream::new(source, 0)
        })
        .collect();
    let err = CombinedResultSet::open(streams, &spec, &MergeConfig::default()).collect().await.unwrap_err();
    assert_eq!(err, MergeError::Node { node: 3, message: "connection reset by peer".into() });
}
