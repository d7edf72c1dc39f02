use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crate::{database::NodeId, executor::Row};

/// Blocking cursor over one node's result set.
///
/// Implementations wrap a node connection; `fetch` may block on I/O and is
/// always called from a blocking worker, never from the async merge loop.
pub trait NodeResultSet: Send + 'static {
    fn node_id(&self) -> NodeId;

    /// Next row, `Ok(None)` once the node has no more rows.
    fn fetch(&mut self) -> io::Result<Option<Row>>;

    /// Release the node-side cursor. Called exactly once by the producer.
    fn close(&mut self);
}

/// What a producer hands to its position manager.
///
/// `End` is its own variant, so no row (an all-NULL one included) can be
/// mistaken for the end of the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Row(Row),
    End,
    Failed(String),
}

/// In-memory node result set, for embedders replaying buffered results.
#[derive(Debug, Clone)]
pub struct MemoryResultSet {
    node: NodeId,
    rows: VecDeque<Row>,
    failure: Option<(usize, String)>,
    delay: Option<Duration>,
    fetched: usize,
    closed: bool,
}

impl MemoryResultSet {
    pub fn new(node: NodeId, rows: Vec<Row>) -> Self {
        Self { node, rows: rows.into(), failure: None, delay: None, fetched: 0, closed: false }
    }

    /// Fail with `message` after `rows` rows were fetched.
    pub fn failing_after(mut self, rows: usize, message: &str) -> Self {
        self.failure = Some((rows, message.to_string()));
        self
    }

    /// Sleep before every fetch, like a slow node.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl NodeResultSet for MemoryResultSet {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn fetch(&mut self) -> io::Result<Option<Row>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some((after, message)) = &self.failure {
            if self.fetched >= *after {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, message.clone()));
            }
        }
        let row = self.rows.pop_front();
        if row.is_some() {
            self.fetched += 1;
        }
        Ok(row)
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn end_marker_differs_from_an_all_null_row() {
        let null_row = Fetched::Row(Row::new(vec![Value::Null, Value::Null]));
        let empty_row = Fetched::Row(Row::new(vec![]));
        assert_ne!(null_row, Fetched::End);
        assert_ne!(empty_row, Fetched::End);
    }

    #[test]
    fn memory_result_set_fails_after_the_given_rows() {
        let mut rs = MemoryResultSet::new(2, vec![Row::new(vec![json!(1)]), Row::new(vec![json!(2)])])
            .failing_after(1, "connection reset");
        assert_eq!(rs.fetch().unwrap(), Some(Row::new(vec![json!(1)])));
        let err = rs.fetch().unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }
}
