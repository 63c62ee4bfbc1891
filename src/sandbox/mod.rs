//! The sandbox: the host-call boundary around guest modules
//!
//! A guest module sees a private linear memory and a closed surface of
//! named intrinsics. This module owns that boundary: bounds-checked guest
//! memory access, per-thread descriptor ownership, the host-call registry,
//! and the module instance that ties them together for one invocation.

pub mod error;
pub mod fd_table;
pub mod host_calls;
pub mod memory;
pub mod module;

pub use error::{Trap, TrapResult};
pub use host_calls::{host_calls, HostCall, HostCallTable};
pub use memory::{GuestMemory, WASM_PAGE_SIZE};
pub use module::{ExecutionContext, GuestFn, ModuleInstance, ModuleLoader, UnconfiguredLoader};
