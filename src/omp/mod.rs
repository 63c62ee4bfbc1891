//! OpenMP runtime shim
//!
//! Implements the compiler-emitted OpenMP entry points. A parallel region
//! runs either as native host threads sharing one guest memory, or as
//! chained invocations spread across the fleet with shared variables
//! reconciled through the state store. The intrinsics register into the
//! host-call table alongside the syscalls.

pub mod fork;
pub mod level;
pub mod loops;
pub mod reduce;
pub mod thread;

pub use fork::run_chained_microtask;
pub use level::{Level, TeamBarrier, TeamLock};
pub use loops::{for_static_init, StaticForBounds, SCH_STATIC, SCH_STATIC_CHUNKED};
pub use reduce::REDUCE_ACC_KEY;

use std::sync::atomic::{fence, Ordering};

use tracing::debug;

use crate::sandbox::error::TrapResult;
use crate::sandbox::host_calls::HostCallTable;
use crate::sandbox::module::ExecutionContext;

pub(crate) fn register_host_calls(table: &mut HostCallTable) {
    table.register("omp_get_thread_num", 0, omp_get_thread_num);
    table.register("omp_get_num_threads", 0, omp_get_num_threads);
    table.register("omp_get_max_threads", 0, omp_get_max_threads);
    table.register("omp_get_level", 0, omp_get_level);
    table.register("omp_get_max_active_levels", 0, omp_get_max_active_levels);
    table.register("omp_set_max_active_levels", 1, omp_set_max_active_levels);
    table.register("omp_set_num_threads", 1, omp_set_num_threads);
    table.register("omp_get_num_devices", 0, omp_get_num_devices);
    table.register("omp_set_default_device", 1, omp_set_default_device);

    table.register("__kmpc_global_thread_num", 1, kmpc_global_thread_num);
    table.register("__kmpc_push_num_threads", 3, kmpc_push_num_threads);
    table.register("__kmpc_fork_call", 4, kmpc_fork_call);
    table.register("__kmpc_barrier", 2, kmpc_barrier);
    table.register("__kmpc_critical", 3, kmpc_critical);
    table.register("__kmpc_end_critical", 3, kmpc_end_critical);
    table.register("__kmpc_master", 2, kmpc_master);
    table.register("__kmpc_end_master", 2, kmpc_end_master);
    table.register("__kmpc_flush", 1, kmpc_flush);
    table.register("__kmpc_for_static_init_4", 9, kmpc_for_static_init_4);
    table.register("__kmpc_for_static_fini", 2, kmpc_for_static_fini);
    table.register("__kmpc_reduce", 7, kmpc_reduce);
    table.register("__kmpc_reduce_nowait", 7, kmpc_reduce_nowait);
    table.register("__kmpc_end_reduce", 3, kmpc_end_reduce);
    table.register("__kmpc_end_reduce_nowait", 3, kmpc_end_reduce_nowait);
    table.register("__cumulus_debug_copy", 2, cumulus_debug_copy);
}

/// Thread number of the caller within its team
fn omp_get_thread_num(_ctx: &ExecutionContext, _args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_get_thread_num");
    Ok(thread::this_thread_num() as i32)
}

/// Number of threads in the team executing the current parallel region
fn omp_get_num_threads(_ctx: &ExecutionContext, _args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_get_num_threads");
    Ok(thread::current_level().num_threads as i32)
}

/// Team size a parallel region without a num_threads clause would get
fn omp_get_max_threads(_ctx: &ExecutionContext, _args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_get_max_threads");
    Ok(thread::current_level().get_next_level_num_threads() as i32)
}

fn omp_get_level(_ctx: &ExecutionContext, _args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_get_level");
    Ok(thread::current_level().depth as i32)
}

fn omp_get_max_active_levels(_ctx: &ExecutionContext, _args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_get_max_active_levels");
    Ok(thread::current_level().max_active_level())
}

fn omp_set_max_active_levels(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_set_max_active_levels {}", args[0]);
    thread::current_level().set_max_active_level(args[0]);
    Ok(0)
}

fn omp_set_num_threads(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_set_num_threads {}", args[0]);
    thread::current_level().set_wanted_num_threads(args[0]);
    Ok(0)
}

fn omp_get_num_devices(_ctx: &ExecutionContext, _args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_get_num_devices");
    Ok(thread::num_devices() as i32)
}

fn omp_set_default_device(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - omp_set_default_device {}", args[0]);
    thread::set_default_device(args[0]);
    Ok(0)
}

fn kmpc_global_thread_num(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_global_thread_num {}", args[0]);
    Ok(thread::this_thread_num() as i32)
}

fn kmpc_push_num_threads(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!(
        "S - __kmpc_push_num_threads {} {} {}",
        args[0], args[1], args[2]
    );
    thread::current_level().push_num_threads(args[2]);
    Ok(0)
}

fn kmpc_fork_call(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!(
        "S - __kmpc_fork_call {} {} {} {}",
        args[0], args[1], args[2], args[3]
    );
    fork::fork_call(ctx, args[1], args[2], args[3])
}

/// No thread in the team runs past the barrier until all arrive
fn kmpc_barrier(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_barrier {} {}", args[0], args[1]);
    thread::current_level().barrier_wait();
    Ok(0)
}

/// The compiler's lock id is unused: the team's own lock controls entry
fn kmpc_critical(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_critical {} {} {}", args[0], args[1], args[2]);
    thread::current_level().enter_critical();
    Ok(0)
}

fn kmpc_end_critical(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!(
        "S - __kmpc_end_critical {} {} {}",
        args[0], args[1], args[2]
    );
    thread::current_level().exit_critical();
    Ok(0)
}

/// 1 iff the caller should run the master block
fn kmpc_master(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_master {} {}", args[0], args[1]);
    Ok(if thread::this_thread_num() == 0 { 1 } else { 0 })
}

fn kmpc_end_master(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_end_master {} {}", args[0], args[1]);
    debug_assert_eq!(thread::this_thread_num(), 0);
    Ok(0)
}

/// Full fence, then yield so `while(flag) flush` loops cannot livelock
fn kmpc_flush(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_flush {}", args[0]);
    fence(Ordering::SeqCst);
    std::thread::yield_now();
    Ok(0)
}

fn kmpc_for_static_init_4(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (last_ptr, lower_ptr, upper_ptr, stride_ptr) =
        (args[3] as u32, args[4] as u32, args[5] as u32, args[6] as u32);
    let (schedule, incr, chunk) = (args[2], args[7], args[8]);
    debug!(
        "S - __kmpc_for_static_init_4 {} {} {} {} {} {} {} {} {}",
        args[0], args[1], schedule, last_ptr, lower_ptr, upper_ptr, stride_ptr, incr, chunk
    );

    let memory = ctx.memory();
    let level = thread::current_level();
    let bounds = loops::for_static_init(
        schedule,
        thread::this_thread_num(),
        level.num_threads,
        memory.read_i32(lower_ptr)?,
        memory.read_i32(upper_ptr)?,
        incr,
        chunk,
    )?;

    memory.write_i32(last_ptr, bounds.last_iter as i32)?;
    memory.write_i32(lower_ptr, bounds.lower)?;
    memory.write_i32(upper_ptr, bounds.upper)?;
    memory.write_i32(stride_ptr, bounds.stride)?;
    Ok(0)
}

fn kmpc_for_static_fini(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_for_static_fini {} {}", args[0], args[1]);
    Ok(0)
}

fn kmpc_reduce(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!(
        "S - __kmpc_reduce {} {} {} {} {} {} {}",
        args[0], args[1], args[2], args[3], args[4], args[5], args[6]
    );
    Ok(reduce::start_reduction(&thread::current_level()))
}

fn kmpc_reduce_nowait(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!(
        "S - __kmpc_reduce_nowait {} {} {} {} {} {} {}",
        args[0], args[1], args[2], args[3], args[4], args[5], args[6]
    );
    reduce::start_reduction_nowait(ctx, args[4] as u32)
}

fn kmpc_end_reduce(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __kmpc_end_reduce {} {} {}", args[0], args[1], args[2]);
    if thread::is_distributed() {
        return Err(reduce::end_reduction_distributed());
    }
    reduce::end_reduction(&thread::current_level());
    Ok(0)
}

fn kmpc_end_reduce_nowait(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!(
        "S - __kmpc_end_reduce_nowait {} {} {}",
        args[0], args[1], args[2]
    );
    if thread::is_distributed() {
        return Err(reduce::end_reduction_distributed());
    }
    reduce::end_reduction(&thread::current_level());
    Ok(0)
}

/// Debug helper for chasing threaded stack issues: copy one i32 between
/// guest addresses.
fn cumulus_debug_copy(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("S - __cumulus_debug_copy {} {}", args[0], args[1]);
    let memory = ctx.memory();
    let value = memory.read_i32(args[0] as u32)?;
    debug!("{}: copy {}", thread::this_thread_num(), value);
    memory.write_i32(args[1] as u32, value)?;
    Ok(0)
}
