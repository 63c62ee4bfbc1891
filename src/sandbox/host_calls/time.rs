//! Timing host calls
//!
//! The guest's libc believes in a 32-bit `timespec`, so `clock_gettime`
//! writes a pair of 32-bit values regardless of the host's native widths.

use tracing::{debug, warn};

use crate::sandbox::error::TrapResult;
use crate::sandbox::module::ExecutionContext;

use super::HostCallTable;

pub(super) fn register(table: &mut HostCallTable) {
    table.register("__syscall_clock_gettime", 2, sys_clock_gettime);
    table.register("__syscall_gettimeofday", 2, |_, args| {
        debug!("S - gettimeofday {} {}", args[0], args[1]);
        Err(crate::sandbox::error::Trap::unimplemented("gettimeofday"))
    });
}

fn sys_clock_gettime(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (clock_id, result_addr) = (args[0], args[1] as u32);
    debug!("I - clock_gettime {} {}", clock_id, result_addr);

    let mut timespec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let result = unsafe { libc::clock_gettime(clock_id as libc::clockid_t, &mut timespec) };
    if result != 0 {
        warn!("host clock {} failed ({})", clock_id, result);
    }

    // 32-bit tv_sec/tv_nsec pair, truncated from the host's widths
    let memory = ctx.memory();
    memory.write_i32(result_addr, timespec.tv_sec as i32)?;
    memory.write_i32(result_addr + 4, timespec.tv_nsec as i32)?;
    Ok(0)
}
