//! Fork/join
//!
//! A parallel region either spawns native host threads that share the
//! parent's guest memory, or snapshots the memory and emits chained async
//! invocations that the scheduler may place anywhere in the fleet. The
//! second path is taken when the invocation addresses more than one
//! device. Shared variables of a chained team reconcile through the
//! state store.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::sandbox::error::{Trap, TrapResult};
use crate::sandbox::module::ExecutionContext;
use crate::scheduler::{message_factory, AwaitError};

use super::level::Level;
use super::reduce::REDUCE_ACC_KEY;
use super::thread as omp_thread;

/// Stack size for spawned team threads
const OMP_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Implementation of the fork-call entry point
pub(super) fn fork_call(
    ctx: &ExecutionContext,
    argc: i32,
    microtask_ptr: i32,
    args_ptr: i32,
) -> TrapResult<i32> {
    if omp_thread::num_devices() != 1 {
        distributed_fork(ctx, argc, microtask_ptr, args_ptr)?;
    } else {
        local_fork(ctx, argc, microtask_ptr, args_ptr)?;
    }
    Ok(0)
}

/// Read the shared-variable pointer array for the microtask
fn read_arg_pointers(ctx: &ExecutionContext, argc: i32, args_ptr: i32) -> TrapResult<Vec<u32>> {
    if argc > 0 {
        ctx.memory().read_u32_vec(args_ptr as u32, argc as u32)
    } else {
        Ok(Vec::new())
    }
}

/// Microtask calling convention: thread number, argument count, then the
/// shared-variable pointers.
fn microtask_args(thread_num: u32, argc: i32, arg_ptrs: &[u32]) -> Vec<i32> {
    let mut args = Vec::with_capacity(2 + arg_ptrs.len());
    args.push(thread_num as i32);
    args.push(argc);
    args.extend(arg_ptrs.iter().map(|p| *p as i32));
    args
}

/// Spawn and join a team of host threads sharing the parent's memory
fn local_fork(
    ctx: &ExecutionContext,
    argc: i32,
    microtask_ptr: i32,
    args_ptr: i32,
) -> TrapResult<()> {
    let level = omp_thread::current_level();
    let next_num_threads = level.get_next_level_num_threads();
    level.clear_pushed_num_threads();

    let next_level = Level::new_team(&level, next_num_threads);
    let arg_ptrs = read_arg_pointers(ctx, argc, args_ptr)?;
    let microtask = ctx.module.get_table_element(microtask_ptr as u32)?;
    let distributed = omp_thread::is_distributed();

    debug!(
        "forking local team of {} at depth {}",
        next_num_threads, next_level.depth
    );

    let mut handles = Vec::with_capacity(next_num_threads as usize);
    for thread_num in 0..next_num_threads {
        let ctx = ctx.clone();
        let team_level = Arc::clone(&next_level);
        let microtask = Arc::clone(&microtask);
        let call_args = microtask_args(thread_num, argc, &arg_ptrs);

        let handle = std::thread::Builder::new()
            .name(format!("omp-{}-{}", team_level.depth, thread_num))
            .stack_size(OMP_STACK_SIZE)
            .spawn(move || {
                // Team state must be in place before the microtask runs
                omp_thread::enter_team(team_level, thread_num, distributed);
                match microtask(&ctx, &call_args) {
                    Ok(code) => code,
                    Err(trap) => {
                        error!("OMP thread {} trapped: {}", thread_num, trap);
                        1
                    }
                }
            })
            .map_err(|e| Trap::TransportError {
                reason: format!("failed to spawn OMP thread: {}", e),
            })?;
        handles.push(handle);
    }

    let mut errors = 0u32;
    for handle in handles {
        match handle.join() {
            Ok(0) => {}
            Ok(code) => {
                warn!("OMP thread exited with code {}", code);
                errors += 1;
            }
            Err(_) => {
                error!("OMP thread panicked");
                errors += 1;
            }
        }
    }

    if errors > 0 {
        return Err(Trap::OmpChildrenFailed { errors });
    }
    Ok(())
}

/// Snapshot the parent and emit one chained async invocation per team
/// member, then gather their results and read the reduction back.
fn distributed_fork(
    ctx: &ExecutionContext,
    argc: i32,
    microtask_ptr: i32,
    args_ptr: i32,
) -> TrapResult<()> {
    let level = omp_thread::current_level();
    let next_num_threads = level.get_next_level_num_threads();
    level.clear_pushed_num_threads();

    info!("forking chained team of {}", next_num_threads);

    // Fresh accumulator for this fork's reduction
    ctx.state
        .set_i64(REDUCE_ACC_KEY, 0)
        .map_err(|e| Trap::StateUnavailable {
            reason: e.to_string(),
        })?;

    // Snapshot keys are scoped per fork so nested parallel regions work;
    // the key dies once every child result has been consumed.
    let snapshot_key = format!("omp-snapshot-{}-{}", ctx.call.id, level.depth);
    let snapshot_size = ctx.module.snapshot_to_state(&snapshot_key, &*ctx.state)?;

    let arg_ptrs = read_arg_pointers(ctx, argc, args_ptr)?;
    let reduce_target = arg_ptrs.first().copied();

    let mut chained_ids = Vec::with_capacity(next_num_threads as usize);
    for thread_num in 0..next_num_threads {
        let mut call = message_factory(&ctx.call.user, &ctx.call.function);
        call.is_async = true;
        call.snapshot_key = Some(snapshot_key.clone());
        call.snapshot_size = Some(snapshot_size);
        call.func_ptr = Some(microtask_ptr as u32);
        call.omp_thread_num = Some(thread_num);
        call.omp_num_threads = Some(next_num_threads);
        call.omp_function_args = arg_ptrs.clone();

        debug!(
            "forked thread {} of call {} -> chained call {}",
            thread_num, ctx.call.id, call.id
        );
        chained_ids.push(call.id);
        ctx.scheduler.call_function(call);
    }

    // This executor is blocked until the children return; let the
    // scheduler hand its slot to someone else.
    ctx.scheduler.notify_awaiting(&ctx.call);

    let timeout = ctx.config.chained_call_timeout;
    let mut errors = 0u32;
    for (thread_num, chained_id) in chained_ids.iter().enumerate() {
        info!(
            "waiting for thread #{} (call {}) with timeout {:?}",
            thread_num, chained_id, timeout
        );
        match ctx.scheduler.get_result(*chained_id, timeout) {
            Ok(result) if result.return_value == 0 => {}
            Ok(result) => {
                warn!(
                    "chained call {} returned {}",
                    chained_id, result.return_value
                );
                errors += 1;
            }
            Err(AwaitError::Timeout { call_id }) => {
                error!("timed out waiting for chained call {}", call_id);
                errors += 1;
            }
            Err(AwaitError::Transport { reason }) => {
                error!("transport failure awaiting {}: {}", chained_id, reason);
                errors += 1;
            }
        }
    }

    ctx.scheduler.notify_finished_awaiting(&ctx.call);

    // The last child result has been consumed
    if let Err(e) = ctx.state.delete(&snapshot_key) {
        warn!("failed to delete snapshot {}: {}", snapshot_key, e);
    }

    // An unreadable accumulator fails the invocation: the reduction
    // result would be silently wrong otherwise.
    let accumulated =
        ctx.state
            .get_i64(REDUCE_ACC_KEY)
            .map_err(|e| Trap::StateUnavailable {
                reason: e.to_string(),
            })?;
    if let Some(target) = reduce_target {
        debug!("writing reduction value {} back to {}", accumulated, target);
        ctx.memory().write_i32(target, accumulated as i32)?;
    }

    if errors > 0 {
        return Err(Trap::OmpChildrenFailed { errors });
    }
    Ok(())
}

/// Execute one chained team member on this node: materialise the parent's
/// team shape from the message and run the microtask from the table.
///
/// The caller has already restored the snapshot into the module's memory.
pub fn run_chained_microtask(ctx: &ExecutionContext) -> TrapResult<i32> {
    let call = &ctx.call;
    let thread_num = call
        .omp_thread_num
        .ok_or_else(|| Trap::unimplemented("chained OMP call without thread number"))?;
    let num_threads = call.omp_num_threads.unwrap_or(1);
    let func_ptr = call
        .func_ptr
        .ok_or_else(|| Trap::unimplemented("chained OMP call without function pointer"))?;

    debug!(
        "executing chained thread {}/{} of {}/{}",
        thread_num, num_threads, call.user, call.function
    );

    let team = Level::new_chained_team(&omp_thread::current_level(), num_threads);
    omp_thread::enter_team(team, thread_num, true);

    let microtask = ctx.module.get_table_element(func_ptr)?;
    let argc = call.omp_function_args.len() as i32;
    let call_args = microtask_args(thread_num, argc, &call.omp_function_args);
    microtask(ctx, &call_args)
}
