//! Scheduler façade
//!
//! The node-placement policy lives outside this crate; what the OMP fork
//! path and the worker pool consume is the small contract below: place a
//! message, await a result, and tell the scheduler when an executor slot
//! is blocked on children so it can be reused. [`LocalScheduler`] is the
//! in-process implementation used by single-node deployments and tests.

pub mod bus;
pub mod message;

pub use bus::{
    BusError, BusResult, GlobalMessageBus, InMemoryGlobalBus, InMemoryNodeBus, NodeMessageBus,
};
pub use message::{flush_request, message_factory, InvocationMessage};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Result type for awaiting a chained call
pub type AwaitResult = Result<InvocationMessage, AwaitError>;

/// Errors while awaiting a function result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitError {
    /// The result did not arrive within the caller's timeout
    Timeout { call_id: u64 },
    /// The transport failed before a result could arrive
    Transport { reason: String },
}

impl fmt::Display for AwaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { call_id } => {
                write!(f, "timed out waiting for call {}", call_id)
            }
            Self::Transport { reason } => {
                write!(f, "transport failure while awaiting: {}", reason)
            }
        }
    }
}

impl std::error::Error for AwaitError {}

/// The call/await/chain contract consumed by the OMP runtime and the pool
pub trait Scheduler: Send + Sync {
    /// Place a message for execution
    fn call_function(&self, msg: InvocationMessage);

    /// Feed for executor slots: next invocation scheduled on this node
    fn next_invocation(&self, timeout: Duration) -> Option<InvocationMessage>;

    /// Record a finished invocation's result message
    fn publish_result(&self, msg: InvocationMessage);

    /// Claim the result of `call_id`, destroying it. Blocks up to `timeout`.
    fn get_result(&self, call_id: u64, timeout: Duration) -> AwaitResult;

    /// The calling executor is blocked on children; its slot may be reused
    fn notify_awaiting(&self, msg: &InvocationMessage);

    /// The calling executor is runnable again
    fn notify_finished_awaiting(&self, msg: &InvocationMessage);
}

/// In-process scheduler: one execution queue, one result table
pub struct LocalScheduler {
    queue: Mutex<VecDeque<InvocationMessage>>,
    queued: Condvar,
    results: Mutex<HashMap<u64, InvocationMessage>>,
    result_ready: Condvar,
    awaiting: AtomicUsize,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            queued: Condvar::new(),
            results: Mutex::new(HashMap::new()),
            result_ready: Condvar::new(),
            awaiting: AtomicUsize::new(0),
        }
    }

    /// Number of executors currently blocked on chained children
    pub fn awaiting_count(&self) -> usize {
        self.awaiting.load(Ordering::Relaxed)
    }

    /// Messages queued but not yet picked up by an executor
    pub fn queued_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for LocalScheduler {
    fn call_function(&self, msg: InvocationMessage) {
        debug!("scheduling {}/{} (id {})", msg.user, msg.function, msg.id);
        self.queue.lock().unwrap().push_back(msg);
        self.queued.notify_one();
    }

    fn next_invocation(&self, timeout: Duration) -> Option<InvocationMessage> {
        let start = Instant::now();
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return None;
            }
            let (q, _) = self.queued.wait_timeout(queue, timeout - elapsed).unwrap();
            queue = q;
        }
    }

    fn publish_result(&self, msg: InvocationMessage) {
        debug!("result for call {} -> {}", msg.id, msg.return_value);
        self.results.lock().unwrap().insert(msg.id, msg);
        self.result_ready.notify_all();
    }

    fn get_result(&self, call_id: u64, timeout: Duration) -> AwaitResult {
        let start = Instant::now();
        let mut results = self.results.lock().unwrap();
        loop {
            if let Some(msg) = results.remove(&call_id) {
                return Ok(msg);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(AwaitError::Timeout { call_id });
            }
            let (r, _) = self
                .result_ready
                .wait_timeout(results, timeout - elapsed)
                .unwrap();
            results = r;
        }
    }

    fn notify_awaiting(&self, msg: &InvocationMessage) {
        self.awaiting.fetch_add(1, Ordering::Relaxed);
        debug!("call {} blocked awaiting children", msg.id);
    }

    fn notify_finished_awaiting(&self, msg: &InvocationMessage) {
        self.awaiting.fetch_sub(1, Ordering::Relaxed);
        debug!("call {} runnable again", msg.id);
    }
}
