//! Host-call table
//!
//! The whitelist of intrinsics a guest module can invoke, keyed by the
//! symbol the guest imports. The table is built once at start-up and
//! read-only for the life of the process; modules resolve their imports
//! against it at link time and dispatch through [`HostCallTable::invoke`].
//!
//! Every handler logs at entry with its raw arguments. Anything fatal
//! surfaces as a [`Trap`], which tears the invocation down.

mod io;
mod memory;
mod socket;
mod time;

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::error::{Trap, TrapResult};
use super::module::ExecutionContext;

/// Signature shared by every registered intrinsic
pub type HostCallHandler = fn(&ExecutionContext, &[i32]) -> TrapResult<i32>;

/// One registered intrinsic
pub struct HostCall {
    pub name: &'static str,
    pub arity: usize,
    handler: HostCallHandler,
}

/// The process-wide registry of intrinsics
pub struct HostCallTable {
    entries: HashMap<&'static str, HostCall>,
}

impl HostCallTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, name: &'static str, arity: usize, handler: HostCallHandler) {
        let previous = self.entries.insert(
            name,
            HostCall {
                name,
                arity,
                handler,
            },
        );
        debug_assert!(previous.is_none(), "duplicate host call {}", name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatch `name` with `args` on behalf of the executing guest
    pub fn invoke(&self, ctx: &ExecutionContext, name: &str, args: &[i32]) -> TrapResult<i32> {
        let call = self
            .entries
            .get(name)
            .ok_or_else(|| Trap::unimplemented(name.to_string()))?;
        if args.len() != call.arity {
            return Err(Trap::unimplemented(format!(
                "{} called with {} args (expects {})",
                call.name,
                args.len(),
                call.arity
            )));
        }
        (call.handler)(ctx, args)
    }
}

/// The immutable table, initialised on first use
pub fn host_calls() -> &'static HostCallTable {
    static TABLE: Lazy<HostCallTable> = Lazy::new(|| {
        let mut table = HostCallTable::new();
        io::register(&mut table);
        socket::register(&mut table);
        memory::register(&mut table);
        time::register(&mut table);
        crate::omp::register_host_calls(&mut table);
        table
    });
    &TABLE
}
