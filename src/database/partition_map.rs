use std::{fmt::Debug, sync::atomic::{AtomicUsize, Ordering}};

use xxhash_rust::xxh3::xxh3_64;

use crate::database::{normalize_node_list, NodeId};

/// Number of hash buckets a [`HashPartitionMap`] deals over its nodes.
pub const HASH_BUCKET_COUNT: usize = 1024;

/// Maps a partitioning value to the node(s) that own it.
///
/// Instances are read-only once shared, so they are handed around as
/// `Arc<dyn PartitionMap>` between steps and threads.
pub trait PartitionMap: Send + Sync + Debug {
    /// Nodes holding `value`; `None` stands for SQL NULL.
    fn get_partitions(&self, value: Option<&str>) -> Vec<NodeId>;

    /// Every node that holds some part of the data.
    fn all_partitions(&self) -> Vec<NodeId>;

    /// Nodes a join against this data must run on.
    fn join_partitions(&self) -> Vec<NodeId>;

    /// Rebuild an even spread over `nodes`.
    fn generate_distribution(&mut self, nodes: &[NodeId]);

    fn kind(&self) -> &'static str;
}

/// Hash partitioning: xxh3 over the normalized value picks one of a fixed
/// ring of buckets, and buckets are dealt round-robin over the nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashPartitionMap {
    buckets: Vec<NodeId>,
    nodes: Vec<NodeId>,
}

impl HashPartitionMap {
    pub fn new(nodes: &[NodeId]) -> Self {
        let mut map = Self { buckets: Vec::new(), nodes: Vec::new() };
        map.generate_distribution(nodes);
        map
    }

    pub fn bucket_of(value: Option<&str>) -> usize {
        match value {
            // NULL gets a fixed bucket so it lands on one node consistently
            None => 0,
            Some(v) => (xxh3_64(v.as_bytes()) % HASH_BUCKET_COUNT as u64) as usize,
        }
    }
}

impl PartitionMap for HashPartitionMap {
    fn get_partitions(&self, value: Option<&str>) -> Vec<NodeId> {
        if self.buckets.is_empty() {
            return Vec::new();
        }
        vec![self.buckets[Self::bucket_of(value)]]
    }

    fn all_partitions(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn join_partitions(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn generate_distribution(&mut self, nodes: &[NodeId]) {
        let mut nodes = nodes.to_vec();
        normalize_node_list(&mut nodes);
        self.buckets = if nodes.is_empty() {
            Vec::new()
        } else {
            (0..HASH_BUCKET_COUNT).map(|i| nodes[i % nodes.len()]).collect()
        };
        self.nodes = nodes;
    }

    fn kind(&self) -> &'static str { "hash" }
}

/// Round-robin placement: inserts rotate over the nodes, so a value does not
/// identify a node and lookups must visit all of them.
#[derive(Debug)]
pub struct RobinPartitionMap {
    nodes: Vec<NodeId>,
    next: AtomicUsize,
}

impl RobinPartitionMap {
    pub fn new(nodes: &[NodeId]) -> Self {
        let mut map = Self { nodes: Vec::new(), next: AtomicUsize::new(0) };
        map.generate_distribution(nodes);
        map
    }

    /// Node receiving the next inserted row.
    pub fn next_insert_node(&self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        Some(self.nodes[i % self.nodes.len()])
    }
}

impl PartitionMap for RobinPartitionMap {
    fn get_partitions(&self, _value: Option<&str>) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn all_partitions(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn join_partitions(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn generate_distribution(&mut self, nodes: &[NodeId]) {
        let mut nodes = nodes.to_vec();
        normalize_node_list(&mut nodes);
        self.nodes = nodes;
        self.next.store(0, Ordering::Relaxed);
    }

    fn kind(&self) -> &'static str { "robin" }
}

/// All data on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinglePartitionMap {
    node: Option<NodeId>,
}

impl SinglePartitionMap {
    pub fn new(node: NodeId) -> Self {
        Self { node: Some(node) }
    }
}

impl PartitionMap for SinglePartitionMap {
    fn get_partitions(&self, _value: Option<&str>) -> Vec<NodeId> {
        self.node.into_iter().collect()
    }

    fn all_partitions(&self) -> Vec<NodeId> {
        self.node.into_iter().collect()
    }

    fn join_partitions(&self) -> Vec<NodeId> {
        self.node.into_iter().collect()
    }

    fn generate_distribution(&mut self, nodes: &[NodeId]) {
        self.node = nodes.iter().copied().min();
    }

    fn kind(&self) -> &'static str { "one" }
}

/// Full copy on every node (lookup tables).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedPartitionMap {
    nodes: Vec<NodeId>,
}

impl ReplicatedPartitionMap {
    pub fn new(nodes: &[NodeId]) -> Self {
        let mut map = Self { nodes: Vec::new() };
        map.generate_distribution(nodes);
        map
    }
}

impl PartitionMap for ReplicatedPartitionMap {
    fn get_partitions(&self, _value: Option<&str>) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn all_partitions(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    // any single copy is enough to join against
    fn join_partitions(&self) -> Vec<NodeId> {
        self.nodes.first().copied().into_iter().collect()
    }

    fn generate_distribution(&mut self, nodes: &[NodeId]) {
        let mut nodes = nodes.to_vec();
        normalize_node_list(&mut nodes);
        self.nodes = nodes;
    }

    fn kind(&self) -> &'static str { "replicated" }
}
