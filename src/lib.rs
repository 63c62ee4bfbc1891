//! cumulus - a serverless execution core
//!
//! Runs untrusted user functions compiled to a sandboxed bytecode inside
//! worker processes, distributes invocations across a fleet of nodes, and
//! provides OpenMP-style intra-function parallelism that scales
//! transparently from shared-memory threads on one node to chained remote
//! invocations across many.
//!
//! Three subsystems make up the core:
//! - [`sandbox`]: the host-call boundary - guest memory translation,
//!   per-thread descriptor ownership, and the intrinsic whitelist
//! - [`omp`]: the OpenMP runtime shim - fork/join, barriers, critical
//!   sections, static loop schedules and reductions
//! - [`worker`]: the executor pool - token-gated slots, bus listeners and
//!   graceful shutdown
//!
//! The compiler/interpreter, the placement policy and the external state
//! backend stay behind the seams in [`sandbox::ModuleLoader`],
//! [`scheduler::Scheduler`] and [`state::StateStore`].

pub mod config;
pub mod omp;
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use config::{StateMode, SystemConfig};
pub use sandbox::{ExecutionContext, GuestMemory, ModuleInstance, ModuleLoader, Trap, TrapResult};
pub use scheduler::{InvocationMessage, Scheduler};
pub use state::StateStore;
pub use worker::WorkerThreadPool;
