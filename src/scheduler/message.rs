//! Invocation messages
//!
//! One message describes one execution of a user function. Messages are
//! immutable after creation apart from the scheduler-stamped fields, and
//! are destroyed once their result has been claimed by the awaiter.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Description of one function invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMessage {
    /// Unique id, assigned by the factory
    pub id: u64,
    pub user: String,
    pub function: String,
    /// Async messages never block the sender
    pub is_async: bool,
    /// Node the scheduler has placed this invocation on
    pub scheduled_node: String,
    /// Memory snapshot to materialise before executing (chained OMP calls)
    pub snapshot_key: Option<String>,
    pub snapshot_size: Option<usize>,
    /// Thread number within the OMP team, when this is a chained OMP call
    pub omp_thread_num: Option<u32>,
    /// Team size, when this is a chained OMP call
    pub omp_num_threads: Option<u32>,
    /// Index of the microtask in the module's indirect function table
    pub func_ptr: Option<u32>,
    /// Guest pointers to the OMP shared variables, in declaration order
    pub omp_function_args: Vec<u32>,
    /// Return code, stamped when the invocation completes
    pub return_value: i32,
    /// Sharing-bus control message: drain local state and re-prime preloads
    pub is_flush_request: bool,
}

impl InvocationMessage {
    /// Whether this message is a chained OMP team member
    pub fn is_omp_thread(&self) -> bool {
        self.omp_thread_num.is_some() && self.func_ptr.is_some()
    }
}

/// Build a fresh message for `user/function` with a unique id
pub fn message_factory(user: &str, function: &str) -> InvocationMessage {
    InvocationMessage {
        id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
        user: user.to_string(),
        function: function.to_string(),
        is_async: false,
        scheduled_node: String::new(),
        snapshot_key: None,
        snapshot_size: None,
        omp_thread_num: None,
        omp_num_threads: None,
        func_ptr: None,
        omp_function_args: Vec::new(),
        return_value: 0,
        is_flush_request: false,
    }
}

/// Build a flush request for the sharing bus
pub fn flush_request() -> InvocationMessage {
    let mut msg = message_factory("", "");
    msg.is_flush_request = true;
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_assigns_unique_ids() {
        let a = message_factory("demo", "echo");
        let b = message_factory("demo", "echo");
        assert_ne!(a.id, b.id);
        assert_eq!(a.user, "demo");
        assert_eq!(a.return_value, 0);
        assert!(!a.is_omp_thread());
    }

    #[test]
    fn test_omp_thread_detection() {
        let mut msg = message_factory("demo", "loop");
        msg.omp_thread_num = Some(2);
        assert!(!msg.is_omp_thread());
        msg.func_ptr = Some(5);
        assert!(msg.is_omp_thread());
    }
}
