//! Module instances and execution context
//!
//! A [`ModuleInstance`] owns one guest linear memory, one indirect function
//! table and the set of compiled function handles. The compiler and
//! interpreter live outside this crate; a compiled function reaches us as
//! a [`GuestFn`] handle registered in the table, and the loader hierarchy
//! is behind the [`ModuleLoader`] trait.
//!
//! An instance lives for one invocation, but may host several host threads
//! at once when a local OMP team runs inside it.

use std::sync::{Arc, RwLock};

use slab::Slab;

use crate::config::SystemConfig;
use crate::scheduler::{InvocationMessage, Scheduler};
use crate::state::StateStore;

use super::error::{Trap, TrapResult};
use super::memory::GuestMemory;

/// A compiled guest function, callable through the indirect table.
///
/// Arguments and return value are the sandbox's 32-bit integers; a host
/// call that traps propagates out through the `TrapResult`.
pub type GuestFn = Arc<dyn Fn(&ExecutionContext, &[i32]) -> TrapResult<i32> + Send + Sync>;

/// One instantiated guest module
pub struct ModuleInstance {
    memory: GuestMemory,
    table: RwLock<Slab<GuestFn>>,
    entry: RwLock<Option<u32>>,
}

impl ModuleInstance {
    pub fn new(initial_pages: u32, max_pages: u32) -> Self {
        Self {
            memory: GuestMemory::new(initial_pages, max_pages),
            table: RwLock::new(Slab::new()),
            entry: RwLock::new(None),
        }
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Add a compiled function to the indirect table, returning its index
    pub fn register_function(&self, func: GuestFn) -> u32 {
        self.table.write().unwrap().insert(func) as u32
    }

    /// Mark a registered function as the module entry point
    pub fn set_entry(&self, index: u32) {
        *self.entry.write().unwrap() = Some(index);
    }

    /// Fetch a function handle from the indirect table
    pub fn get_table_element(&self, index: u32) -> TrapResult<GuestFn> {
        self.table
            .read()
            .unwrap()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Trap::unimplemented(format!("indirect table index {}", index)))
    }

    /// Call the module's entry function
    pub fn invoke_entry(&self, ctx: &ExecutionContext) -> TrapResult<i32> {
        let index = self
            .entry
            .read()
            .unwrap()
            .ok_or_else(|| Trap::unimplemented("module has no entry function"))?;
        let func = self.get_table_element(index)?;
        func(ctx, &[])
    }

    /// Serialise the current memory into the state store under `key`,
    /// returning the snapshot size.
    pub fn snapshot_to_state(&self, key: &str, store: &dyn StateStore) -> TrapResult<usize> {
        let snapshot = self.memory.snapshot();
        store
            .set_bytes(key, &snapshot)
            .map_err(|e| Trap::StateUnavailable {
                reason: e.to_string(),
            })?;
        Ok(snapshot.len())
    }

    /// Materialise a snapshot previously taken on another instance
    pub fn restore_from_state(&self, key: &str, store: &dyn StateStore) -> TrapResult<()> {
        let bytes = store
            .get_bytes(key)
            .map_err(|e| Trap::StateUnavailable {
                reason: e.to_string(),
            })?
            .ok_or_else(|| Trap::StateUnavailable {
                reason: format!("snapshot key '{}' missing", key),
            })?;
        self.memory.restore(&bytes)
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("memory", &self.memory)
            .field("table_len", &self.table.read().unwrap().len())
            .finish()
    }
}

/// Everything a host-call handler can reach: the executing module, the
/// invocation being executed, and the node services behind it.
#[derive(Clone)]
pub struct ExecutionContext {
    pub module: Arc<ModuleInstance>,
    pub call: InvocationMessage,
    pub scheduler: Arc<dyn Scheduler>,
    pub state: Arc<dyn StateStore>,
    pub config: Arc<SystemConfig>,
}

impl ExecutionContext {
    pub fn memory(&self) -> &GuestMemory {
        self.module.memory()
    }
}

/// Seam to the external module loader hierarchy
pub trait ModuleLoader: Send + Sync {
    /// Produce a fresh instance for one invocation of `user/function`
    fn instantiate(&self, user: &str, function: &str) -> TrapResult<Arc<ModuleInstance>>;
}

/// Placeholder loader for deployments wired up without one
pub struct UnconfiguredLoader;

impl ModuleLoader for UnconfiguredLoader {
    fn instantiate(&self, user: &str, function: &str) -> TrapResult<Arc<ModuleInstance>> {
        Err(Trap::unimplemented(format!(
            "no module loader configured for {}/{}",
            user, function
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{message_factory, LocalScheduler};
    use crate::state::InMemoryStateStore;

    pub(crate) fn test_context(instance: Arc<ModuleInstance>) -> ExecutionContext {
        ExecutionContext {
            module: instance,
            call: message_factory("test", "fn"),
            scheduler: Arc::new(LocalScheduler::new()),
            state: Arc::new(InMemoryStateStore::new()),
            config: Arc::new(SystemConfig::default()),
        }
    }

    #[test]
    fn test_table_registration() {
        let instance = ModuleInstance::new(1, 4);
        let idx = instance.register_function(Arc::new(|_, args| Ok(args[0] + 1)));
        let func = instance.get_table_element(idx).unwrap();

        let ctx = test_context(Arc::new(ModuleInstance::new(1, 1)));
        assert_eq!(func(&ctx, &[41]).unwrap(), 42);
        assert!(instance.get_table_element(99).is_err());
    }

    #[test]
    fn test_entry_invocation() {
        let instance = Arc::new(ModuleInstance::new(1, 4));
        let idx = instance.register_function(Arc::new(|_, _| Ok(7)));
        instance.set_entry(idx);

        let ctx = test_context(Arc::clone(&instance));
        assert_eq!(instance.invoke_entry(&ctx).unwrap(), 7);
    }

    #[test]
    fn test_snapshot_roundtrip_through_state() {
        let store = InMemoryStateStore::new();
        let parent = ModuleInstance::new(2, 4);
        parent.memory().write_u32(128, 0xABCD).unwrap();

        let size = parent.snapshot_to_state("snap", &store).unwrap();
        assert_eq!(size, parent.memory().size_bytes());

        let child = ModuleInstance::new(1, 4);
        child.restore_from_state("snap", &store).unwrap();
        assert_eq!(child.memory().read_u32(128).unwrap(), 0xABCD);
        assert_eq!(child.memory().num_pages(), 2);
    }

    #[test]
    fn test_missing_snapshot_is_state_unavailable() {
        let store = InMemoryStateStore::new();
        let child = ModuleInstance::new(1, 1);
        let err = child.restore_from_state("nope", &store).unwrap_err();
        assert!(matches!(err, Trap::StateUnavailable { .. }));
    }
}
