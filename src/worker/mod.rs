//! Worker pool and executor slots
//!
//! The long-lived machinery of one node: a token-gated pool of executor
//! threads fed by the scheduler, plus the listeners that pull work in
//! from the buses.

pub mod pool;
pub mod thread;
pub mod tokens;

pub use pool::WorkerThreadPool;
pub use thread::{execute_invocation, WorkerDeps, WorkerThread};
pub use tokens::TokenPool;
