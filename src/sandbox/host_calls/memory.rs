//! Memory host calls
//!
//! The guest's allocator reaches us through `mmap`/`munmap`/`brk`. There
//! is no file mapping: anonymous mappings grow the linear memory by whole
//! pages and growth is never rolled back.

use tracing::{debug, warn};

use crate::sandbox::error::{Trap, TrapResult};
use crate::sandbox::memory::WASM_PAGE_SIZE;
use crate::sandbox::module::ExecutionContext;

use super::HostCallTable;

pub(super) fn register(table: &mut HostCallTable) {
    table.register("__syscall_mmap", 6, sys_mmap);
    table.register("__syscall_munmap", 2, sys_munmap);
    table.register("__syscall_brk", 1, sys_brk);
    table.register("__syscall_madvise", 3, |_, args| {
        debug!("S - madvise {} {} {}", args[0], args[1], args[2]);
        Err(Trap::unimplemented("madvise"))
    });
    table.register("__syscall_mremap", 5, |_, args| {
        debug!(
            "S - mremap {} {} {} {} {}",
            args[0], args[1], args[2], args[3], args[4]
        );
        Err(Trap::unimplemented("mremap"))
    });
}

/// Anonymous mappings only; the start address hint is ignored
fn sys_mmap(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (addr, length, prot, flags, fd, offset) =
        (args[0], args[1] as u32, args[2], args[3], args[4], args[5]);
    debug!(
        "S - mmap {} {} {} {} {} {}",
        addr, length, prot, flags, fd, offset
    );

    if fd != -1 {
        return Err(Trap::unimplemented("mmap with file descriptor"));
    }

    let pages = (length as usize).div_ceil(WASM_PAGE_SIZE) as u32;
    debug!("mmap adding {} pages", pages);

    let base_page = ctx.memory().grow(pages)?;
    Ok((base_page as usize * WASM_PAGE_SIZE) as i32)
}

fn sys_munmap(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (addr, length) = (args[0] as u32, args[1] as u32);
    debug!("S - munmap {} {}", addr, length);

    let base_page = addr as usize / WASM_PAGE_SIZE;
    let pages = (length as usize).div_ceil(WASM_PAGE_SIZE);
    debug!("munmap releasing {} pages", pages);

    ctx.memory().unmap(base_page as u32, pages as u32)?;
    Ok(0)
}

/// Move the break to the requested address if it lies beyond the current
/// break; never shrink. Returns the break as it was before any growth.
fn sys_brk(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let addr = args[0] as u32;
    debug!("S - brk {}", addr);

    let memory = ctx.memory();
    let target_pages = (addr as usize).div_ceil(WASM_PAGE_SIZE) as u32;
    let current_pages = memory.num_pages();
    let current_break = (current_pages as usize * WASM_PAGE_SIZE) as i32;

    if target_pages > memory.max_pages() {
        warn!(
            "brk requesting {} pages (max {})",
            target_pages,
            memory.max_pages()
        );
    }

    if target_pages <= current_pages {
        debug!("brk with no effect");
        return Ok(current_break);
    }

    let expansion = target_pages - current_pages;
    debug!("brk adding {} pages", expansion);
    if let Err(trap) = memory.grow(expansion) {
        warn!("brk growth failed: {}", trap);
    }

    Ok(current_break)
}
