use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    database::{MergeConfig, NodeId},
    executor::{CompareOptions, Helpers, MergeError, MergeResult, NodeResultSet, PositionManager, Row},
    planner::{ExecutionPlan, PlanId, PlanTree},
};

/// One ORDER BY key of the merged output; `position` is 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub position: usize,
    pub descending: bool,
}

/// A plan whose last step streams rows to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeInput {
    pub plan: PlanId,
    pub union_group: u8,
    pub nodes: Vec<NodeId>,
}

/// What the coordinator applies on top of the node streams of one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSpec {
    pub sort_keys: Vec<SortKey>,
    pub distinct: bool,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub inputs: Vec<MergeInput>,
}

impl MergeSpec {
    /// Merge work of a compiled statement: one input per streaming plan,
    /// each union branch tagged with its result group.
    ///
    /// Branch streams arrive sorted in the union's order with their own
    /// window already applied, so only the statement's window is left here.
    pub fn for_tree(tree: &PlanTree) -> Self {
        let root = tree.root();
        let plans: Vec<&ExecutionPlan> = if root.is_union {
            root.union_children
                .iter()
                .filter_map(|id| tree.plan(*id))
                .filter(|p| p.is_final_union_part)
                .collect()
        } else {
            vec![root]
        };
        let inputs = plans
            .into_iter()
            .filter_map(|plan| {
                let detail = plan.last_step()?.producing_detail();
                detail.combine_results.then(|| MergeInput {
                    plan: plan.id,
                    union_group: plan.union_result_group(),
                    nodes: detail.producer_nodes.clone(),
                })
            })
            .collect();
        Self {
            sort_keys: root
                .order_by
                .iter()
                .map(|k| SortKey { position: k.position.saturating_sub(1), descending: k.descending })
                .collect(),
            distinct: root.is_distinct,
            offset: root.merge_offset,
            limit: root.merge_limit,
            inputs,
        }
    }

    pub fn is_streaming(&self) -> bool {
        !self.inputs.is_empty()
    }
}

/// One node result set handed to the merge.
pub struct NodeStream {
    pub source: Box<dyn NodeResultSet>,
    pub union_group: u8,
}

impl NodeStream {
    pub fn new(source: impl NodeResultSet, union_group: u8) -> Self {
        Self { source: Box::new(source), union_group }
    }
}

#[derive(Debug)]
struct SortOrder {
    keys: Vec<SortKey>,
    options: CompareOptions,
}

impl SortOrder {
    fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (i, key) in self.keys.iter().enumerate() {
            let ord = Helpers::cmp_json_for_sort(&a[i], &b[i], key.descending, &self.options);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Head row of one stream waiting in the merge queue.
#[derive(Debug)]
struct Pending {
    key: Vec<Value>,
    node: NodeId,
    stream: usize,
    order: Arc<SortOrder>,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // node then stream index keep equal keys in node order
        self.order
            .compare(&self.key, &other.key)
            .then(self.node.cmp(&other.node))
            .then(self.stream.cmp(&other.stream))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

#[derive(Debug)]
struct Cursor {
    manager: PositionManager,
    union_group: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeState {
    Fresh,
    Running,
    Done,
    Closed,
}

/// Coordinator-side merge of every node stream of a query into the client
/// result: ordering, union groups, DISTINCT and the global window.
#[derive(Debug)]
pub struct CombinedResultSet {
    cursors: Vec<Cursor>,
    queue: BTreeSet<Pending>,
    order: Arc<SortOrder>,
    distinct: bool,
    offset: u64,
    limit: Option<u64>,
    seen: HashSet<String>,
    seen_union: HashSet<String>,
    skipped: u64,
    emitted: u64,
    state: MergeState,
}

impl CombinedResultSet {
    /// Start a producer per stream. Must be called inside a tokio runtime.
    pub fn open(streams: Vec<NodeStream>, spec: &MergeSpec, config: &MergeConfig) -> Self {
        debug!(streams = streams.len(), keys = spec.sort_keys.len(), distinct = spec.distinct, "opening merged result");
        let cursors = streams
            .into_iter()
            .map(|s| Cursor { manager: PositionManager::start(s.source, config), union_group: s.union_group })
            .collect();
        Self {
            cursors,
            queue: BTreeSet::new(),
            order: Arc::new(SortOrder { keys: spec.sort_keys.clone(), options: CompareOptions::from(config) }),
            distinct: spec.distinct,
            offset: spec.offset.unwrap_or(0),
            limit: spec.limit,
            seen: HashSet::new(),
            seen_union: HashSet::new(),
            skipped: 0,
            emitted: 0,
            state: MergeState::Fresh,
        }
    }

    /// Next row of the merged result, `None` when complete.
    ///
    /// A failed or silent node ends the merge with an error; every stream is
    /// closed before it is returned.
    pub async fn next(&mut self) -> MergeResult<Option<Row>> {
        match self.state {
            MergeState::Closed => return Err(MergeError::Closed),
            MergeState::Done => return Ok(None),
            MergeState::Fresh => {
                self.state = MergeState::Running;
                for stream in 0..self.cursors.len() {
                    if let Err(e) = self.advance(stream).await {
                        self.finish().await;
                        return Err(e);
                    }
                }
            }
            MergeState::Running => {}
        }

        loop {
            if self.limit.is_some_and(|l| self.emitted >= l) {
                self.finish().await;
                return Ok(None);
            }
            let Some(head) = self.queue.pop_first() else {
                self.finish().await;
                return Ok(None);
            };
            let cursor = &mut self.cursors[head.stream];
            let group = cursor.union_group;
            let Some(row) = cursor.manager.take_current() else { continue };
            if let Err(e) = self.advance(head.stream).await {
                self.finish().await;
                return Err(e);
            }
            if !self.accept(&row, group) {
                continue;
            }
            if self.skipped < self.offset {
                self.skipped += 1;
                continue;
            }
            self.emitted += 1;
            return Ok(Some(row));
        }
    }

    /// Drain the merge into a vector.
    pub async fn collect(mut self) -> MergeResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Close every stream. Further reads fail with [`MergeError::Closed`].
    pub async fn close(&mut self) {
        self.close_cursors().await;
        self.state = MergeState::Closed;
    }

    async fn finish(&mut self) {
        self.close_cursors().await;
        if self.state != MergeState::Closed {
            self.state = MergeState::Done;
        }
        debug!(emitted = self.emitted, skipped = self.skipped, "merged result complete");
    }

    async fn close_cursors(&mut self) {
        self.queue.clear();
        for cursor in &mut self.cursors {
            cursor.manager.close().await;
        }
    }

    async fn advance(&mut self, stream: usize) -> MergeResult<()> {
        let cursor = &mut self.cursors[stream];
        if !cursor.manager.next().await? {
            return Ok(());
        }
        let Some(row) = cursor.manager.current() else { return Ok(()) };
        let mut key = Vec::with_capacity(self.order.keys.len());
        for k in &self.order.keys {
            let value = row.get(k.position).ok_or(MergeError::SortPosition { position: k.position, width: row.len() })?;
            key.push(value.clone());
        }
        let node = cursor.manager.node();
        self.queue.insert(Pending { key, node, stream, order: self.order.clone() });
        Ok(())
    }

    fn accept(&mut self, row: &Row, union_group: u8) -> bool {
        if !self.distinct && union_group != 1 {
            return true;
        }
        let key = Helpers::distinct_key(row.values(), &self.order.options);
        if self.distinct {
            self.seen.insert(key)
        } else {
            self.seen_union.insert(key)
        }
    }
}
