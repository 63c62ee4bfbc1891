//! End-to-end scenarios across the sandbox, the OMP runtime and the
//! worker pool.
//!
//! Guest behaviour is modelled with closures registered in a module's
//! indirect table; they reach the host exactly the way compiled guest
//! code does, through the host-call table.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cumulus::config::SystemConfig;
use cumulus::omp;
use cumulus::sandbox::{
    host_calls, ExecutionContext, ModuleInstance, ModuleLoader, Trap, TrapResult,
};
use cumulus::scheduler::{
    flush_request, message_factory, GlobalMessageBus, InMemoryGlobalBus, InMemoryNodeBus,
    LocalScheduler, NodeMessageBus, Scheduler,
};
use cumulus::state::{InMemoryStateStore, StateStore};
use cumulus::worker::{execute_invocation, WorkerDeps, WorkerThread, WorkerThreadPool};

/// Loader producing a fresh instance per invocation, built by `factory`
struct FactoryLoader<F>(F);

impl<F> ModuleLoader for FactoryLoader<F>
where
    F: Fn() -> Arc<ModuleInstance> + Send + Sync,
{
    fn instantiate(&self, _user: &str, _function: &str) -> TrapResult<Arc<ModuleInstance>> {
        Ok((self.0)())
    }
}

fn context_for(module: Arc<ModuleInstance>, config: SystemConfig) -> ExecutionContext {
    ExecutionContext {
        module,
        call: message_factory("test", "fn"),
        scheduler: Arc::new(LocalScheduler::new()),
        state: Arc::new(InMemoryStateStore::new()),
        config: Arc::new(config),
    }
}

fn write_guest_string(module: &ModuleInstance, addr: u32, s: &str) {
    let bytes = s.as_bytes();
    let dest = module.memory().slice_mut(addr, bytes.len() as u32 + 1).unwrap();
    dest[..bytes.len()].copy_from_slice(bytes);
    dest[bytes.len()] = 0;
}

// ============================================================================
// Host-call boundary
// ============================================================================

#[test]
fn test_open_whitelist_read_close() {
    let mut hosts_file = tempfile::NamedTempFile::new().unwrap();
    hosts_file.write_all(b"127.0.0.1 localhost\n").unwrap();

    let mut config = SystemConfig::default();
    config.hosts_file = hosts_file.path().to_path_buf();

    let module = Arc::new(ModuleInstance::new(1, 4));
    write_guest_string(&module, 64, "/etc/hosts");
    let ctx = context_for(Arc::clone(&module), config);

    let fd = host_calls().invoke(&ctx, "__syscall_open", &[64, 0, 0]).unwrap();
    assert!(fd > 0, "whitelisted open returns a descriptor");

    let n = host_calls()
        .invoke(&ctx, "__syscall_read", &[fd, 512, 16])
        .unwrap();
    assert_eq!(n, 16);
    assert_eq!(
        module.memory().slice(512, 16).unwrap(),
        &b"127.0.0.1 localhost\n"[..16]
    );

    assert_eq!(
        host_calls().invoke(&ctx, "__syscall_close", &[fd]).unwrap(),
        0
    );

    // The descriptor left the ownership table with the close
    let err = host_calls()
        .invoke(&ctx, "__syscall_read", &[fd, 512, 16])
        .unwrap_err();
    assert!(matches!(err, Trap::FdNotOwned { .. }));
}

#[test]
fn test_open_blocked_path_traps() {
    let module = Arc::new(ModuleInstance::new(1, 4));
    write_guest_string(&module, 64, "/etc/passwd");
    let ctx = context_for(module, SystemConfig::default());

    let err = host_calls()
        .invoke(&ctx, "__syscall_open", &[64, 0, 0])
        .unwrap_err();
    assert!(matches!(err, Trap::PathBlocked { .. }));
}

#[test]
fn test_open_write_mode_rejected() {
    let module = Arc::new(ModuleInstance::new(1, 4));
    write_guest_string(&module, 64, "/etc/hosts");
    let ctx = context_for(module, SystemConfig::default());

    let err = host_calls()
        .invoke(&ctx, "__syscall_open", &[64, 0, 0o644])
        .unwrap_err();
    assert!(matches!(err, Trap::ModeRejected { .. }));
}

#[test]
fn test_descriptor_is_owned_per_thread() {
    let mut hosts_file = tempfile::NamedTempFile::new().unwrap();
    hosts_file.write_all(b"x\n").unwrap();
    let mut config = SystemConfig::default();
    config.hosts_file = hosts_file.path().to_path_buf();

    let module = Arc::new(ModuleInstance::new(1, 4));
    write_guest_string(&module, 64, "/etc/hosts");
    let ctx = context_for(module, config);

    let fd = host_calls().invoke(&ctx, "__syscall_open", &[64, 0, 0]).unwrap();

    // A foreign thread referencing the same descriptor always fails
    let foreign_ctx = ctx.clone();
    let result = std::thread::spawn(move || {
        host_calls().invoke(&foreign_ctx, "__syscall_read", &[fd, 512, 4])
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(Trap::FdNotOwned { .. })));

    // The owner can still use and close it
    assert_eq!(
        host_calls().invoke(&ctx, "__syscall_close", &[fd]).unwrap(),
        0
    );
}

#[test]
fn test_brk_grows_never_shrinks() {
    let page = 65536i32;
    let module = Arc::new(ModuleInstance::new(2, 4));
    let ctx = context_for(Arc::clone(&module), SystemConfig::default());

    // Growing to 3 pages returns the previous break
    let previous = host_calls()
        .invoke(&ctx, "__syscall_brk", &[3 * page])
        .unwrap();
    assert_eq!(previous, 2 * page);
    assert_eq!(module.memory().num_pages(), 3);

    // A break below the current one is a no-op returning the current break
    let current = host_calls().invoke(&ctx, "__syscall_brk", &[page]).unwrap();
    assert_eq!(current, 3 * page);
    assert_eq!(module.memory().num_pages(), 3);
}

#[test]
fn test_mmap_extends_accessible_range() {
    let page = 65536u32;
    let module = Arc::new(ModuleInstance::new(2, 8));
    let ctx = context_for(Arc::clone(&module), SystemConfig::default());
    let old_size = module.memory().size_bytes() as u32;

    // Anonymous mapping of 3 pages
    let base = host_calls()
        .invoke(&ctx, "__syscall_mmap", &[0, 3 * page as i32, 0, 0, -1, 0])
        .unwrap();
    assert_eq!(base as u32, old_size);

    // Any access into the new region is now in bounds
    for addr in [old_size, old_size + page, old_size + 3 * page - 4] {
        module.memory().write_u32(addr, 7).unwrap();
    }

    // File-backed mappings stay unsupported
    let err = host_calls()
        .invoke(&ctx, "__syscall_mmap", &[0, 100, 0, 0, 5, 0])
        .unwrap_err();
    assert!(matches!(err, Trap::Unimplemented { .. }));
}

// ============================================================================
// OMP runtime
// ============================================================================

#[test]
fn test_static_for_balanced_partition() {
    omp::thread::reset_for_invocation(4);
    let module = Arc::new(ModuleInstance::new(1, 4));
    let ctx = context_for(Arc::clone(&module), SystemConfig::default());

    let team = omp::Level::new_team(&omp::thread::current_level(), 4);
    let memory = module.memory();
    let (last_ptr, lower_ptr, upper_ptr, stride_ptr) = (100, 104, 108, 112);

    let mut ranges = Vec::new();
    let mut last_flags = Vec::new();
    for thread_num in 0..4 {
        omp::thread::enter_team(Arc::clone(&team), thread_num, false);
        memory.write_i32(lower_ptr as u32, 0).unwrap();
        memory.write_i32(upper_ptr as u32, 9).unwrap();

        host_calls()
            .invoke(
                &ctx,
                "__kmpc_for_static_init_4",
                &[
                    0,
                    thread_num as i32,
                    omp::SCH_STATIC,
                    last_ptr,
                    lower_ptr,
                    upper_ptr,
                    stride_ptr,
                    1,
                    0,
                ],
            )
            .unwrap();

        ranges.push((
            memory.read_i32(lower_ptr as u32).unwrap(),
            memory.read_i32(upper_ptr as u32).unwrap(),
        ));
        last_flags.push(memory.read_i32(last_ptr as u32).unwrap() == 1);
        assert_eq!(memory.read_i32(stride_ptr as u32).unwrap(), 10);
    }

    assert_eq!(ranges, vec![(0, 2), (3, 5), (6, 7), (8, 9)]);
    assert_eq!(last_flags, vec![false, false, false, true]);
    omp::thread::reset_for_invocation(4);
}

/// A team of four increments a shared counter ten times each inside a
/// critical section; after the barrier the master observes the full count.
#[test]
fn test_local_fork_critical_counter() {
    const COUNTER: u32 = 1024;
    const OBSERVED: u32 = 1028;
    const ARGS: u32 = 1040;

    let build = || {
        let module = Arc::new(ModuleInstance::new(1, 4));

        // Microtask at table index 0
        module.register_function(Arc::new(|ctx: &ExecutionContext, args: &[i32]| {
            let thread_num = args[0];
            let counter_addr = args[2] as u32;
            let table = host_calls();

            for _ in 0..10 {
                table.invoke(ctx, "__kmpc_critical", &[0, thread_num, 0])?;
                let value = ctx.memory().read_i32(counter_addr)?;
                ctx.memory().write_i32(counter_addr, value + 1)?;
                table.invoke(ctx, "__kmpc_end_critical", &[0, thread_num, 0])?;
            }

            // Everything stored before the barrier is visible after it
            table.invoke(ctx, "__kmpc_barrier", &[0, thread_num])?;
            if table.invoke(ctx, "__kmpc_master", &[0, thread_num])? == 1 {
                let value = ctx.memory().read_i32(counter_addr)?;
                ctx.memory().write_i32(OBSERVED, value)?;
            }
            Ok(0)
        }));

        // Entry at table index 1
        let entry = module.register_function(Arc::new(|ctx: &ExecutionContext, _: &[i32]| {
            let memory = ctx.memory();
            memory.write_i32(COUNTER, 0)?;
            memory.write_u32(ARGS, COUNTER)?;

            let table = host_calls();
            table.invoke(ctx, "__kmpc_push_num_threads", &[0, 0, 4])?;
            table.invoke(ctx, "__kmpc_fork_call", &[0, 1, 0, ARGS as i32])?;

            // The parent joins the team before returning
            let counter = memory.read_i32(COUNTER)?;
            let observed = memory.read_i32(OBSERVED)?;
            if counter == 40 && observed == 40 {
                Ok(0)
            } else {
                Ok(counter)
            }
        }));
        module.set_entry(entry);
        module
    };

    let deps = WorkerDeps {
        config: Arc::new(SystemConfig::default()),
        scheduler: Arc::new(LocalScheduler::new()),
        state: Arc::new(InMemoryStateStore::new()),
        loader: Arc::new(FactoryLoader(build)),
    };

    let code = execute_invocation(&deps, message_factory("demo", "counter"));
    assert_eq!(code, 0);
}

#[test]
fn test_fork_child_failure_fails_invocation() {
    let build = || {
        let module = Arc::new(ModuleInstance::new(1, 4));
        module.register_function(Arc::new(|_: &ExecutionContext, args: &[i32]| {
            // Thread 2 fails, everyone else succeeds
            Ok(if args[0] == 2 { 1 } else { 0 })
        }));
        let entry = module.register_function(Arc::new(|ctx: &ExecutionContext, _: &[i32]| {
            let table = host_calls();
            table.invoke(ctx, "__kmpc_push_num_threads", &[0, 0, 4])?;
            table.invoke(ctx, "__kmpc_fork_call", &[0, 0, 0, 0])?;
            Ok(0)
        }));
        module.set_entry(entry);
        module
    };

    let deps = WorkerDeps {
        config: Arc::new(SystemConfig::default()),
        scheduler: Arc::new(LocalScheduler::new()),
        state: Arc::new(InMemoryStateStore::new()),
        loader: Arc::new(FactoryLoader(build)),
    };

    // The fork traps with omp-children-failed, so the invocation fails
    let code = execute_invocation(&deps, message_factory("demo", "failing"));
    assert_ne!(code, 0);
}

/// Two chained children each contribute 7 to the accumulator; the parent
/// reads 14 back into the shared variable.
#[test]
fn test_distributed_reduction_two_devices() {
    const SHARED: u32 = 1024;
    const ARGS: u32 = 1040;
    const REDUCE_PTRS: u32 = 2048;

    let build = || {
        let module = Arc::new(ModuleInstance::new(1, 4));

        // Microtask at index 0: runs on a chained child
        module.register_function(Arc::new(|ctx: &ExecutionContext, args: &[i32]| {
            let shared_addr = args[2] as u32;
            let memory = ctx.memory();

            // Local partial result
            memory.write_i32(shared_addr, 7)?;

            // Pointer array for the reduction
            memory.write_u32(REDUCE_PTRS, shared_addr)?;
            let code = host_calls().invoke(
                ctx,
                "__kmpc_reduce_nowait",
                &[0, args[0], 1, 4, REDUCE_PTRS as i32, 0, 0],
            )?;
            // No local combining in distributed mode
            if code == 1 || code == 2 {
                return Ok(3);
            }
            Ok(0)
        }));

        // Entry at index 1: runs on the parent
        let entry = module.register_function(Arc::new(|ctx: &ExecutionContext, _: &[i32]| {
            let memory = ctx.memory();
            memory.write_i32(SHARED as u32, 0)?;
            memory.write_u32(ARGS, SHARED)?;

            let table = host_calls();
            // Two devices routes the fork down the distributed path
            table.invoke(ctx, "omp_set_default_device", &[-2])?;
            table.invoke(ctx, "__kmpc_push_num_threads", &[0, 0, 2])?;
            table.invoke(ctx, "__kmpc_fork_call", &[0, 1, 0, ARGS as i32])?;

            let reduced = memory.read_i32(SHARED)?;
            if reduced == 14 {
                Ok(0)
            } else {
                Ok(50 + reduced)
            }
        }));
        module.set_entry(entry);
        module
    };

    let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let deps = WorkerDeps {
        config: Arc::new(SystemConfig::default()),
        scheduler: Arc::new(LocalScheduler::new()),
        state: Arc::clone(&state),
        loader: Arc::new(FactoryLoader(build)),
    };

    // Two executor slots to pick up the chained children
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for slot in 0..2 {
        let deps = deps.clone();
        let shutdown = Arc::clone(&shutdown);
        workers.push(std::thread::spawn(move || {
            WorkerThread::new(slot, deps).run(&shutdown);
        }));
    }

    let code = execute_invocation(&deps, message_factory("demo", "reduce"));
    assert_eq!(code, 0);
    assert_eq!(state.get_i64(omp::REDUCE_ACC_KEY).unwrap(), 14);

    shutdown.store(true, std::sync::atomic::Ordering::Release);
    for worker in workers {
        worker.join().unwrap();
    }
}

// ============================================================================
// Worker pool
// ============================================================================

fn pool_config() -> SystemConfig {
    let mut config = SystemConfig::default();
    config.thread_pool_size = 2;
    config.global_message_timeout = Duration::from_millis(800);
    config.state_server_addr = "127.0.0.1:0".to_string();
    config.node_id = "test-node".to_string();
    config
}

fn pool_fixture(
    config: SystemConfig,
) -> (
    WorkerThreadPool,
    Arc<LocalScheduler>,
    Arc<InMemoryGlobalBus>,
    Arc<InMemoryNodeBus>,
    Arc<InMemoryStateStore>,
) {
    let scheduler = Arc::new(LocalScheduler::new());
    let state = Arc::new(InMemoryStateStore::new());
    let global_bus = Arc::new(InMemoryGlobalBus::new());
    let sharing_bus = Arc::new(InMemoryNodeBus::new());
    let mpi_bus = Arc::new(InMemoryNodeBus::new());

    let build = || {
        let module = Arc::new(ModuleInstance::new(1, 2));
        let entry = module.register_function(Arc::new(|_: &ExecutionContext, _: &[i32]| Ok(0)));
        module.set_entry(entry);
        module
    };

    let deps = WorkerDeps {
        config: Arc::new(config),
        scheduler: scheduler.clone(),
        state: state.clone(),
        loader: Arc::new(FactoryLoader(build)),
    };

    let pool = WorkerThreadPool::new(
        deps,
        Arc::clone(&global_bus) as Arc<dyn GlobalMessageBus>,
        Arc::clone(&sharing_bus) as Arc<dyn NodeMessageBus>,
        mpi_bus as Arc<dyn NodeMessageBus>,
    )
    .unwrap();

    (pool, scheduler, global_bus, sharing_bus, state)
}

#[test]
fn test_pool_executes_from_global_queue_and_shuts_down() {
    let (mut pool, scheduler, global_bus, _sharing, _state) = pool_fixture(pool_config());

    pool.start_all();

    let msg = message_factory("demo", "ok");
    let id = msg.id;
    global_bus.enqueue(msg);

    let result = scheduler.get_result(id, Duration::from_secs(5)).unwrap();
    assert_eq!(result.return_value, 0);

    // The listener drains out after its timeout, then shutdown joins
    // everything within a bounded time.
    let started = Instant::now();
    pool.wait_for_global_drain();
    pool.shutdown();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(pool.is_shutdown());

    // Every token came home
    assert_eq!(pool.thread_count(), 0);
    assert_eq!(pool.tokens().available(), pool.tokens().capacity());
}

#[test]
fn test_token_accounting_under_load() {
    let (mut pool, scheduler, _global, _sharing, _state) = pool_fixture(pool_config());
    pool.start_thread_pool();

    // Saturate both slots
    for _ in 0..8 {
        scheduler.call_function(message_factory("demo", "ok"));
    }

    // Capacity is conserved whatever the pool is doing
    let tokens = pool.tokens();
    for _ in 0..20 {
        assert_eq!(tokens.taken() + tokens.available(), tokens.capacity());
        std::thread::sleep(Duration::from_millis(10));
    }

    pool.shutdown();
    assert_eq!(pool.tokens().available(), pool.tokens().capacity());
}

#[test]
fn test_sharing_flush_drains_state() {
    let config = pool_config();
    let node_id = config.node_id.clone();
    let (mut pool, _scheduler, _global, sharing_bus, state) = pool_fixture(config);

    state.set_i64("leftover", 9).unwrap();
    pool.start_sharing_listener();

    sharing_bus.send_to_node(&node_id, flush_request());

    // The listener observes the flush within its poll cycle
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.get_i64("leftover").unwrap() != 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(state.get_i64("leftover").unwrap(), 0);

    pool.shutdown();
}

#[test]
fn test_sharing_bus_delivers_invocations() {
    let config = pool_config();
    let node_id = config.node_id.clone();
    let (mut pool, scheduler, _global, sharing_bus, _state) = pool_fixture(config);

    pool.start_thread_pool();
    pool.start_sharing_listener();

    let msg = message_factory("demo", "shared");
    let id = msg.id;
    sharing_bus.send_to_node(&node_id, msg);

    let result = scheduler.get_result(id, Duration::from_secs(5)).unwrap();
    assert_eq!(result.return_value, 0);

    pool.shutdown();
}
