//! Reductions
//!
//! Local teams reduce through a critical section: the begin call takes the
//! level's reduce lock and returns 1 so the caller runs the reduction body
//! inline, the end call releases it. Teams of one skip the lock.
//!
//! A chained team member instead contributes its partial value to the
//! shared accumulator key with an atomic increment and returns the
//! empty-block code, so the compiler emits no local combiner; the parent
//! reconciles after the join and ending the reduction remotely is an
//! error.

use tracing::debug;

use crate::sandbox::error::{Trap, TrapResult};
use crate::sandbox::module::ExecutionContext;

use super::level::Level;
use super::thread;

/// The well-known accumulator key for distributed reductions
pub const REDUCE_ACC_KEY: &str = "omp-reduce";

/// Return code telling the compiler no local combining is needed
const EMPTY_REDUCE_BLOCK: i32 = 4 << 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReductionMethod {
    Critical,
    Empty,
}

fn determine_reduction_method(level: &Level) -> ReductionMethod {
    if level.num_threads == 1 {
        ReductionMethod::Empty
    } else {
        ReductionMethod::Critical
    }
}

/// Begin a local reduction. Returns 1: the caller performs the reduction
/// body itself, under the reduce lock when the team is bigger than one.
pub(super) fn start_reduction(level: &Level) -> i32 {
    match determine_reduction_method(level) {
        ReductionMethod::Critical => {
            debug!("thread {} reduction locking", thread::this_thread_num());
            level.lock_reduce();
            1
        }
        ReductionMethod::Empty => 1,
    }
}

/// End a local reduction, releasing the lock taken by the begin call
pub(super) fn end_reduction(level: &Level) {
    // Releasing a lock nobody holds would be a bug, not a no-op
    if level.num_threads > 1 {
        debug!("thread {} reduction unlocking", thread::this_thread_num());
        level.unlock_reduce();
    }
}

/// The `nowait` begin: locally identical to a blocking reduce, but a
/// chained team member pushes its partial straight to the accumulator.
pub(super) fn start_reduction_nowait(
    ctx: &ExecutionContext,
    reduce_data: u32,
) -> TrapResult<i32> {
    if !thread::is_distributed() {
        return Ok(start_reduction(&thread::current_level()));
    }

    // reduce_data points at the array of pointers to the reduction
    // variables; the first one carries the local partial.
    let memory = ctx.memory();
    let partial_addr = memory.read_u32(reduce_data)?;
    let partial = memory.read_i32(partial_addr)?;
    debug!(
        "thread {} contributing {} to {}",
        thread::this_thread_num(),
        partial,
        REDUCE_ACC_KEY
    );

    ctx.state
        .incr_i64(REDUCE_ACC_KEY, partial as i64)
        .map_err(|e| Trap::StateUnavailable {
            reason: e.to_string(),
        })?;
    Ok(EMPTY_REDUCE_BLOCK)
}

/// End of a reduce in a chained team member: never legal, the parent
/// reconciles the accumulator after the join.
pub(super) fn end_reduction_distributed() -> Trap {
    Trap::unimplemented("end reduce in distributed context")
}
