use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    database::{MergeConfig, NodeId},
    executor::{Fetched, MergeError, MergeResult, NodeResultSet, Row},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Open,
    Exhausted,
    Closed,
}

/// Pull cursor over one node result set.
///
/// A blocking producer drains the node into a bounded channel; the cursor
/// waits on that channel with the merge timeout.
#[derive(Debug)]
pub struct PositionManager {
    node: NodeId,
    receiver: mpsc::Receiver<Fetched>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    current: Option<Row>,
    state: CursorState,
    timeout: Duration,
}

impl PositionManager {
    /// Start the producer for `source`. Must be called inside a tokio runtime.
    pub fn start(source: Box<dyn NodeResultSet>, config: &MergeConfig) -> Self {
        let node = source.node_id();
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let producer = tokio::task::spawn_blocking(move || produce(source, sender, token));
        Self {
            node,
            receiver,
            cancel,
            producer: Some(producer),
            current: None,
            state: CursorState::Open,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn current(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    pub fn take_current(&mut self) -> Option<Row> {
        self.current.take()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state != CursorState::Open
    }

    /// Token that closes this cursor from elsewhere, even while `next` waits.
    pub fn close_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Advance to the next row. `Ok(false)` once the node sent everything.
    pub async fn next(&mut self) -> MergeResult<bool> {
        match self.state {
            CursorState::Closed => return Err(MergeError::Closed),
            CursorState::Exhausted => return Ok(false),
            CursorState::Open => {}
        }
        let cancel = self.cancel.clone();
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(self.timeout, self.receiver.recv()) => Some(r),
        };
        let Some(received) = received else {
            self.shut();
            return Err(MergeError::Closed);
        };

        match received {
            Err(_) => Err(MergeError::Timeout { node: self.node, waited_ms: self.timeout.as_millis() as u64 }),
            Ok(Some(Fetched::Row(row))) => {
                self.current = Some(row);
                Ok(true)
            }
            Ok(Some(Fetched::End)) => {
                self.current = None;
                self.state = CursorState::Exhausted;
                Ok(false)
            }
            Ok(Some(Fetched::Failed(message))) => {
                self.current = None;
                self.state = CursorState::Exhausted;
                Err(MergeError::Node { node: self.node, message })
            }
            Ok(None) => {
                self.current = None;
                self.state = CursorState::Exhausted;
                Err(MergeError::Node { node: self.node, message: "producer stopped without end of stream".into() })
            }
        }
    }

    /// Stop the producer and wait until it released the node result set.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        self.shut();
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.await {
                warn!(node = self.node, error = %e, "merge producer did not finish cleanly");
            }
        }
    }

    fn shut(&mut self) {
        if self.state != CursorState::Closed {
            trace!(node = self.node, "closing node cursor");
        }
        self.cancel.cancel();
        self.receiver.close();
        self.current = None;
        self.state = CursorState::Closed;
    }
}

impl Drop for PositionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn produce(mut source: Box<dyn NodeResultSet>, sender: mpsc::Sender<Fetched>, cancel: CancellationToken) {
    let node = source.node_id();
    debug!(node, "merge producer started");
    let mut rows = 0usize;
    loop {
        if cancel.is_cancelled() {
            debug!(node, rows, "merge producer cancelled");
            break;
        }
        let message = match source.fetch() {
            Ok(Some(row)) => {
                rows += 1;
                Fetched::Row(row)
            }
            Ok(None) => Fetched::End,
            Err(e) => {
                warn!(node, error = %e, "node result stream failed");
                Fetched::Failed(e.to_string())
            }
        };
        let last = !matches!(message, Fetched::Row(_));
        // a closed receiver means the consumer went away
        if sender.blocking_send(message).is_err() || last {
            break;
        }
    }
    source.close();
    debug!(node, rows, "merge producer stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use serde_json::{json, Value};

    use super::*;
    use crate::executor::MemoryResultSet;

    struct Tracked {
        inner: MemoryResultSet,
        closed: Arc<AtomicBool>,
    }

    impl NodeResultSet for Tracked {
        fn node_id(&self) -> NodeId {
            self.inner.node_id()
        }
        fn fetch(&mut self) -> io::Result<Option<Row>> {
            self.inner.fetch()
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn rows(values: &[i64]) -> Vec<Row> {
        values.iter().map(|v| Row::new(vec![json!(v)])).collect()
    }

    fn config(buffer_size: usize, timeout_ms: u64) -> MergeConfig {
        MergeConfig { buffer_size, timeout_ms, ..MergeConfig::default() }
    }

    #[tokio::test]
    async fn reads_every_row_then_reports_end() {
        let source = MemoryResultSet::new(1, vec![Row::new(vec![json!(1)]), Row::new(vec![Value::Null])]);
        let mut cursor = PositionManager::start(Box::new(source), &config(1, 1_000));
        assert!(cursor.next().await.unwrap());
        assert_eq!(cursor.current(), Some(&Row::new(vec![json!(1)])));
        assert!(cursor.next().await.unwrap());
        assert_eq!(cursor.current(), Some(&Row::new(vec![Value::Null])));
        assert!(!cursor.next().await.unwrap());
        assert!(!cursor.next().await.unwrap());
        assert!(cursor.is_exhausted());
        cursor.close().await;
    }

    #[tokio::test]
    async fn node_failure_surfaces_as_error() {
        let source = MemoryResultSet::new(4, rows(&[1, 2])).failing_after(1, "socket closed");
        let mut cursor = PositionManager::start(Box::new(source), &config(4, 1_000));
        assert!(cursor.next().await.unwrap());
        let err = cursor.next().await.unwrap_err();
        assert_eq!(err, MergeError::Node { node: 4, message: "socket closed".into() });
        cursor.close().await;
    }

    #[tokio::test]
    async fn slow_node_times_out() {
        let source = MemoryResultSet::new(2, rows(&[1])).with_delay(Duration::from_millis(300));
        let mut cursor = PositionManager::start(Box::new(source), &config(1, 20));
        let err = cursor.next().await.unwrap_err();
        assert_eq!(err, MergeError::Timeout { node: 2, waited_ms: 20 });
        cursor.close().await;
    }

    #[tokio::test]
    async fn close_twice_releases_source_once_drained_or_not() {
        let closed = Arc::new(AtomicBool::new(false));
        let source = Tracked { inner: MemoryResultSet::new(1, rows(&[1, 2, 3, 4, 5, 6])), closed: closed.clone() };
        let mut cursor = PositionManager::start(Box::new(source), &config(1, 1_000));
        assert!(cursor.next().await.unwrap());
        cursor.close().await;
        cursor.close().await;
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(cursor.next().await.unwrap_err(), MergeError::Closed);
    }

    #[tokio::test]
    async fn close_handle_interrupts_a_waiting_next() {
        let source = MemoryResultSet::new(3, rows(&[1])).with_delay(Duration::from_millis(200));
        let mut cursor = PositionManager::start(Box::new(source), &config(1, 5_000));
        let handle = cursor.close_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        assert_eq!(cursor.next().await.unwrap_err(), MergeError::Closed);
        cursor.close().await;
    }
}
