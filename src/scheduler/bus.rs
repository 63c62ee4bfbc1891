//! Message buses
//!
//! Three transports carry invocation messages: the global queue shared by
//! all nodes, the per-node sharing queue, and the per-node MPI bus. The
//! traits are the seam to the real transports; the in-memory
//! implementations back single-process deployments and tests. Order is
//! FIFO per bus; nothing is guaranteed across buses.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::message::InvocationMessage;

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Errors from bus receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No message arrived within the timeout
    Timeout { waited_ms: u128 },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { waited_ms } => {
                write!(f, "no message on bus after {}ms", waited_ms)
            }
        }
    }
}

impl std::error::Error for BusError {}

/// The queue every node's global listener consumes
pub trait GlobalMessageBus: Send + Sync {
    fn enqueue(&self, msg: InvocationMessage);
    fn next_message(&self, timeout: Duration) -> BusResult<InvocationMessage>;
}

/// A bus addressed by node identity (sharing queue, MPI)
pub trait NodeMessageBus: Send + Sync {
    fn send_to_node(&self, node: &str, msg: InvocationMessage);
    fn next_message_for_node(&self, node: &str, timeout: Duration) -> BusResult<InvocationMessage>;
}

/// Blocking FIFO used by the in-memory transports
struct WaitQueue {
    messages: Mutex<VecDeque<InvocationMessage>>,
    available: Condvar,
}

impl WaitQueue {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, msg: InvocationMessage) {
        self.messages.lock().unwrap().push_back(msg);
        self.available.notify_one();
    }

    fn pop(&self, timeout: Duration) -> BusResult<InvocationMessage> {
        let start = Instant::now();
        let mut queue = self.messages.lock().unwrap();
        loop {
            if let Some(msg) = queue.pop_front() {
                return Ok(msg);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(BusError::Timeout {
                    waited_ms: elapsed.as_millis(),
                });
            }
            let (q, res) = self
                .available
                .wait_timeout(queue, timeout - elapsed)
                .unwrap();
            queue = q;
            if res.timed_out() && queue.is_empty() {
                return Err(BusError::Timeout {
                    waited_ms: start.elapsed().as_millis(),
                });
            }
        }
    }
}

/// In-memory global queue
pub struct InMemoryGlobalBus {
    queue: WaitQueue,
}

impl InMemoryGlobalBus {
    pub fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }
}

impl Default for InMemoryGlobalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMessageBus for InMemoryGlobalBus {
    fn enqueue(&self, msg: InvocationMessage) {
        self.queue.push(msg);
    }

    fn next_message(&self, timeout: Duration) -> BusResult<InvocationMessage> {
        self.queue.pop(timeout)
    }
}

/// In-memory node-addressed bus, one FIFO per node id
pub struct InMemoryNodeBus {
    queues: Mutex<HashMap<String, Arc<WaitQueue>>>,
}

impl InMemoryNodeBus {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queue_for(&self, node: &str) -> Arc<WaitQueue> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(WaitQueue::new()))
            .clone()
    }
}

impl Default for InMemoryNodeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMessageBus for InMemoryNodeBus {
    fn send_to_node(&self, node: &str, msg: InvocationMessage) {
        self.queue_for(node).push(msg);
    }

    fn next_message_for_node(&self, node: &str, timeout: Duration) -> BusResult<InvocationMessage> {
        self.queue_for(node).pop(timeout)
    }
}
