//! Per-thread OMP state
//!
//! Each host thread carries its thread number within the current team and
//! a handle to the team's level. The fork stamps a child's state before
//! the child's microtask runs; a worker resets its state before every
//! invocation because executor threads are long-lived.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::warn;

use super::level::Level;

/// Number of devices a user may address by default
const MAX_USER_DEVICES: i32 = 3;

struct TeamState {
    thread_num: u32,
    level: Arc<Level>,
    /// This thread is one member of a chained (cross-node) team
    distributed: bool,
    /// Device count for this invocation; more than one routes forks down
    /// the distributed path
    num_devices: u32,
}

impl TeamState {
    fn root(default_team_size: u32) -> Self {
        Self {
            thread_num: 0,
            level: Level::root(default_team_size),
            distributed: false,
            num_devices: 1,
        }
    }
}

thread_local! {
    static TEAM: RefCell<Option<TeamState>> = const { RefCell::new(None) };
}

fn with_state<R>(f: impl FnOnce(&mut TeamState) -> R) -> R {
    TEAM.with(|team| {
        let mut slot = team.borrow_mut();
        let state = slot.get_or_insert_with(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1);
            TeamState::root(cores)
        });
        f(state)
    })
}

/// Reset this thread to the root level. Called at the start of every
/// invocation an executor slot picks up.
pub fn reset_for_invocation(default_team_size: u32) {
    TEAM.with(|team| {
        *team.borrow_mut() = Some(TeamState::root(default_team_size));
    });
}

/// Stamp this thread as member `thread_num` of the team at `level`.
/// Must run before the thread's microtask.
pub fn enter_team(level: Arc<Level>, thread_num: u32, distributed: bool) {
    with_state(|state| {
        state.level = level;
        state.thread_num = thread_num;
        state.distributed = distributed;
    });
}

/// Thread number of the caller within its team (0 for the primary)
pub fn this_thread_num() -> u32 {
    with_state(|state| state.thread_num)
}

/// The caller's current level
pub fn current_level() -> Arc<Level> {
    with_state(|state| Arc::clone(&state.level))
}

/// Whether the caller executes as part of a chained team
pub fn is_distributed() -> bool {
    with_state(|state| state.distributed)
}

pub fn num_devices() -> u32 {
    with_state(|state| state.num_devices)
}

/// A negative device number means "use that many devices in parallel";
/// counts past the per-user limit are ignored.
pub fn set_default_device(device: i32) {
    if device.abs() > MAX_USER_DEVICES {
        warn!(
            "default device {} exceeds the {} available, ignoring",
            device, MAX_USER_DEVICES
        );
        return;
    }
    with_state(|state| {
        state.num_devices = device.unsigned_abs();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_state() {
        reset_for_invocation(4);
        assert_eq!(this_thread_num(), 0);
        assert_eq!(current_level().depth, 0);
        assert_eq!(current_level().num_threads, 1);
        assert!(!is_distributed());
        assert_eq!(num_devices(), 1);
    }

    #[test]
    fn test_enter_team() {
        reset_for_invocation(4);
        let team = Level::new_team(&current_level(), 4);
        enter_team(Arc::clone(&team), 2, false);
        assert_eq!(this_thread_num(), 2);
        assert_eq!(current_level().num_threads, 4);
        reset_for_invocation(4);
    }

    #[test]
    fn test_device_count() {
        reset_for_invocation(4);
        set_default_device(2);
        assert_eq!(num_devices(), 2);
        // Negative selects parallel devices
        set_default_device(-3);
        assert_eq!(num_devices(), 3);
        // Out of range is ignored
        set_default_device(9);
        assert_eq!(num_devices(), 3);
        reset_for_invocation(4);
    }
}
