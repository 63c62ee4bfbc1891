//! Per-thread file descriptor ownership
//!
//! A descriptor enters a thread's set only when a whitelisted host call
//! opened or created it on that thread. Host calls that take a descriptor
//! check containment first; operating on a descriptor owned by another
//! thread (or by nobody) traps. The set dies with the thread.

use std::cell::RefCell;
use std::collections::HashSet;

use super::error::{Trap, TrapResult};

thread_local! {
    static OPEN_FDS: RefCell<HashSet<i32>> = RefCell::new(HashSet::new());
}

/// Record `fd` as owned by the calling thread
pub fn insert(fd: i32) {
    OPEN_FDS.with(|fds| {
        fds.borrow_mut().insert(fd);
    });
}

/// Drop `fd` from the calling thread's set
pub fn remove(fd: i32) {
    OPEN_FDS.with(|fds| {
        fds.borrow_mut().remove(&fd);
    });
}

/// Whether the calling thread owns `fd`
pub fn contains(fd: i32) -> bool {
    OPEN_FDS.with(|fds| fds.borrow().contains(&fd))
}

/// Trap unless the calling thread owns `fd`
pub fn check_owned(fd: i32) -> TrapResult<()> {
    if contains(fd) {
        Ok(())
    } else {
        Err(Trap::FdNotOwned { fd })
    }
}
