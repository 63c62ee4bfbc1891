//! Executor slots
//!
//! A [`WorkerThread`] is one long-lived executor: it pulls invocations
//! from the scheduler, instantiates the guest module, runs either the
//! module entry or a chained OMP microtask, and publishes the result. A
//! trap never escapes the slot; it becomes a non-zero return code with
//! the reason in the logs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::SystemConfig;
use crate::omp;
use crate::sandbox::module::{ExecutionContext, ModuleLoader};
use crate::scheduler::{InvocationMessage, Scheduler};
use crate::state::StateStore;

/// How often an idle executor re-checks the shutdown flag
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Shared handles every executor needs
#[derive(Clone)]
pub struct WorkerDeps {
    pub config: Arc<SystemConfig>,
    pub scheduler: Arc<dyn Scheduler>,
    pub state: Arc<dyn StateStore>,
    pub loader: Arc<dyn ModuleLoader>,
}

/// One executor slot, identified by its pool token
pub struct WorkerThread {
    pub slot: usize,
    deps: WorkerDeps,
}

impl WorkerThread {
    pub fn new(slot: usize, deps: WorkerDeps) -> Self {
        Self { slot, deps }
    }

    /// Long-lived worker routine: consume invocations until shutdown
    pub fn run(&self, shutdown: &AtomicBool) {
        debug!("executor slot {} running", self.slot);
        while !shutdown.load(Ordering::Acquire) {
            if let Some(msg) = self.deps.scheduler.next_invocation(IDLE_POLL) {
                execute_invocation(&self.deps, msg);
            }
        }
        debug!("executor slot {} exiting", self.slot);
    }
}

/// Run one invocation to completion and publish its result message.
/// Returns the invocation's return code.
pub fn execute_invocation(deps: &WorkerDeps, msg: InvocationMessage) -> i32 {
    info!(
        "executing {}/{} (id {})",
        msg.user, msg.function, msg.id
    );

    let code = match run_guest(deps, &msg) {
        Ok(code) => code,
        Err(trap) => {
            error!("invocation {} trapped: {}", msg.id, trap);
            1
        }
    };

    let mut result = msg;
    result.return_value = code;
    deps.scheduler.publish_result(result);
    code
}

fn run_guest(deps: &WorkerDeps, msg: &InvocationMessage) -> crate::sandbox::TrapResult<i32> {
    let module = deps.loader.instantiate(&msg.user, &msg.function)?;

    // Executor threads are reused; every invocation starts at the root team
    omp::thread::reset_for_invocation(deps.config.default_team_size as u32);

    // A chained call ships the key of a snapshot this node may not have
    // materialised yet
    if let Some(key) = &msg.snapshot_key {
        debug!("materialising snapshot {} for call {}", key, msg.id);
        module.restore_from_state(key, &*deps.state)?;
    }

    let ctx = ExecutionContext {
        module: Arc::clone(&module),
        call: msg.clone(),
        scheduler: Arc::clone(&deps.scheduler),
        state: Arc::clone(&deps.state),
        config: Arc::clone(&deps.config),
    };

    if msg.is_omp_thread() {
        omp::run_chained_microtask(&ctx)
    } else {
        module.invoke_entry(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::module::ModuleInstance;
    use crate::sandbox::{Trap, TrapResult};
    use crate::scheduler::{message_factory, LocalScheduler};
    use crate::state::InMemoryStateStore;

    struct FixedLoader {
        build: fn() -> Arc<ModuleInstance>,
    }

    impl ModuleLoader for FixedLoader {
        fn instantiate(&self, _user: &str, _function: &str) -> TrapResult<Arc<ModuleInstance>> {
            Ok((self.build)())
        }
    }

    fn deps_with_loader(build: fn() -> Arc<ModuleInstance>) -> WorkerDeps {
        WorkerDeps {
            config: Arc::new(SystemConfig::default()),
            scheduler: Arc::new(LocalScheduler::new()),
            state: Arc::new(InMemoryStateStore::new()),
            loader: Arc::new(FixedLoader { build }),
        }
    }

    #[test]
    fn test_entry_result_published() {
        let deps = deps_with_loader(|| {
            let m = Arc::new(ModuleInstance::new(1, 4));
            let idx = m.register_function(Arc::new(|_, _| Ok(0)));
            m.set_entry(idx);
            m
        });

        let msg = message_factory("demo", "ok");
        let id = msg.id;
        let code = execute_invocation(&deps, msg);
        assert_eq!(code, 0);

        let result = deps
            .scheduler
            .get_result(id, Duration::from_millis(100))
            .unwrap();
        assert_eq!(result.return_value, 0);
    }

    #[test]
    fn test_trap_becomes_nonzero_code() {
        let deps = deps_with_loader(|| {
            let m = Arc::new(ModuleInstance::new(1, 4));
            let idx = m.register_function(Arc::new(|_, _| {
                Err(Trap::PathBlocked {
                    path: "/etc/passwd".into(),
                })
            }));
            m.set_entry(idx);
            m
        });

        let msg = message_factory("demo", "bad");
        let id = msg.id;
        assert_eq!(execute_invocation(&deps, msg), 1);

        let result = deps
            .scheduler
            .get_result(id, Duration::from_millis(100))
            .unwrap();
        assert_eq!(result.return_value, 1);
    }
}
