//! Team levels and their synchronisation primitives
//!
//! A [`Level`] is shared by every member of a team at one nesting depth.
//! It owns the team barrier and the critical/reduce locks, and carries the
//! thread-count overrides that decide the size of the next team. Levels
//! form an upward-linked chain; the parent link is weak so a finished
//! fork's levels can be reclaimed.
//!
//! The locks are acquire/release rather than guard-based because the guest
//! drives lock and unlock through separate host calls.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use tracing::warn;

/// Fixed-arity, self-resetting barrier
///
/// Exactly `arity` arrivals release all waiters exactly once, then the
/// barrier is reset for the next phase.
pub struct TeamBarrier {
    arity: u32,
    state: Mutex<BarrierState>,
    released: Condvar,
}

struct BarrierState {
    arrived: u32,
    generation: u64,
}

impl TeamBarrier {
    pub fn new(arity: u32) -> Self {
        Self {
            arity,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Block until `arity` threads have arrived. Returns true for the
    /// arrival that released the phase.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.arity {
            // Reset before release so the next phase starts clean
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            true
        } else {
            while state.generation == generation {
                state = self.released.wait(state).unwrap();
            }
            false
        }
    }

    /// Number of phases this barrier has completed
    pub fn completed_phases(&self) -> u64 {
        self.state.lock().unwrap().generation
    }
}

/// Team-scoped lock driven by separate lock/unlock host calls
pub struct TeamLock {
    locked: Mutex<bool>,
    available: Condvar,
}

impl TeamLock {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.available.wait(locked).unwrap();
        }
        *locked = true;
    }

    pub fn release(&self) {
        let mut locked = self.locked.lock().unwrap();
        *locked = false;
        self.available.notify_one();
    }
}

impl Default for TeamLock {
    fn default() -> Self {
        Self::new()
    }
}

const UNSET: i32 = -1;

/// Shared state of one team at one nesting depth
pub struct Level {
    /// Nesting depth; 0 for the root level
    pub depth: u32,
    /// Number of threads in this team
    pub num_threads: u32,
    max_active_level: AtomicI32,
    /// One-shot override from `push_num_threads`, consumed by the next fork
    pushed_num_threads: AtomicI32,
    /// Persistent override from `set_num_threads`
    wanted_num_threads: AtomicI32,
    default_team_size: u32,
    /// Absent for single-thread teams and for chained (cross-node) teams
    barrier: Option<TeamBarrier>,
    critical: TeamLock,
    reduce: TeamLock,
    parent: Weak<Level>,
}

impl Level {
    /// The level a fresh invocation starts at: depth 0, one thread
    pub fn root(default_team_size: u32) -> Arc<Self> {
        Arc::new(Self {
            depth: 0,
            num_threads: 1,
            max_active_level: AtomicI32::new(UNSET),
            pushed_num_threads: AtomicI32::new(UNSET),
            wanted_num_threads: AtomicI32::new(UNSET),
            default_team_size: default_team_size.max(1),
            barrier: None,
            critical: TeamLock::new(),
            reduce: TeamLock::new(),
            parent: Weak::new(),
        })
    }

    fn child_of(parent: &Arc<Level>, num_threads: u32, with_barrier: bool) -> Arc<Self> {
        Arc::new(Self {
            depth: parent.depth + 1,
            num_threads,
            max_active_level: AtomicI32::new(parent.max_active_level.load(Ordering::Relaxed)),
            pushed_num_threads: AtomicI32::new(UNSET),
            wanted_num_threads: AtomicI32::new(parent.wanted_num_threads.load(Ordering::Relaxed)),
            default_team_size: parent.default_team_size,
            barrier: (with_barrier && num_threads > 1).then(|| TeamBarrier::new(num_threads)),
            critical: TeamLock::new(),
            reduce: TeamLock::new(),
            parent: Arc::downgrade(parent),
        })
    }

    /// Level for a local team sharing this process's memory
    pub fn new_team(parent: &Arc<Level>, num_threads: u32) -> Arc<Self> {
        Self::child_of(parent, num_threads, true)
    }

    /// Level for one member of a chained team. Members may live on
    /// different nodes, so there is no barrier to block on.
    pub fn new_chained_team(parent: &Arc<Level>, num_threads: u32) -> Arc<Self> {
        Self::child_of(parent, num_threads, false)
    }

    pub fn parent(&self) -> Option<Arc<Level>> {
        self.parent.upgrade()
    }

    /// Team size the next fork will use: the pushed count if set, else the
    /// wanted count, else the system default.
    pub fn get_next_level_num_threads(&self) -> u32 {
        let pushed = self.pushed_num_threads.load(Ordering::Relaxed);
        if pushed > 0 {
            return pushed as u32;
        }
        let wanted = self.wanted_num_threads.load(Ordering::Relaxed);
        if wanted > 0 {
            return wanted as u32;
        }
        self.default_team_size
    }

    /// Consume the one-shot pushed count
    pub fn clear_pushed_num_threads(&self) {
        self.pushed_num_threads.store(UNSET, Ordering::Relaxed);
    }

    pub fn push_num_threads(&self, num_threads: i32) {
        if num_threads > 0 {
            self.pushed_num_threads.store(num_threads, Ordering::Relaxed);
        }
    }

    pub fn set_wanted_num_threads(&self, num_threads: i32) {
        if num_threads > 0 {
            self.wanted_num_threads.store(num_threads, Ordering::Relaxed);
        }
    }

    pub fn max_active_level(&self) -> i32 {
        self.max_active_level.load(Ordering::Relaxed)
    }

    pub fn set_max_active_level(&self, level: i32) {
        if level < 0 {
            warn!("ignoring negative max active level {}", level);
            return;
        }
        self.max_active_level.store(level, Ordering::Relaxed);
    }

    /// Block until the whole team arrives; immediate for teams of one and
    /// for chained teams.
    pub fn barrier_wait(&self) {
        if self.num_threads <= 1 {
            return;
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait();
        }
    }

    /// Completed barrier phases (0 when the level has no barrier)
    pub fn barrier_phases(&self) -> u64 {
        self.barrier.as_ref().map(|b| b.completed_phases()).unwrap_or(0)
    }

    pub fn enter_critical(&self) {
        if self.num_threads > 1 {
            self.critical.acquire();
        }
    }

    pub fn exit_critical(&self) {
        if self.num_threads > 1 {
            self.critical.release();
        }
    }

    pub fn lock_reduce(&self) {
        self.reduce.acquire();
    }

    pub fn unlock_reduce(&self) {
        self.reduce.release();
    }
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("depth", &self.depth)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
