//! Static-for schedule math
//!
//! Computes the per-thread bounds and stride for a statically scheduled
//! worksharing loop. Only the static-chunked and static (balanced)
//! schedules exist; anything else traps. The schedule codes follow
//! Clang's OpenMP runtime tables.

use crate::sandbox::error::{Trap, TrapResult};

/// Schedule: fixed chunks dealt round-robin
pub const SCH_STATIC_CHUNKED: i32 = 33;
/// Schedule: one contiguous, balanced block per thread
pub const SCH_STATIC: i32 = 34;

/// Per-thread result of a static-for init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticForBounds {
    pub lower: i32,
    pub upper: i32,
    pub stride: i32,
    pub last_iter: bool,
}

/// Compute the bounds of `thread_num`'s share of the loop.
///
/// `lower`/`upper` are the loop's inclusive bounds as the compiler emitted
/// them; `incr` the increment; `chunk` the chunk size (static-chunked
/// only, normalised to at least 1).
pub fn for_static_init(
    schedule: i32,
    thread_num: u32,
    num_threads: u32,
    lower: i32,
    upper: i32,
    incr: i32,
    chunk: i32,
) -> TrapResult<StaticForBounds> {
    if num_threads == 1 {
        let stride = if incr > 0 {
            upper - lower + 1
        } else {
            -(lower - upper + 1)
        };
        return Ok(StaticForBounds {
            lower,
            upper,
            stride,
            last_iter: true,
        });
    }

    // Specialised for unit increments: upper - lower can exceed the range
    // of the signed type when divided naively.
    let trip_count: u32 = if incr == 1 {
        upper.wrapping_sub(lower).wrapping_add(1) as u32
    } else if incr == -1 {
        lower.wrapping_sub(upper).wrapping_add(1) as u32
    } else if incr > 0 {
        ((upper - lower) / incr + 1) as u32
    } else {
        ((lower - upper) / -incr + 1) as u32
    };

    match schedule {
        SCH_STATIC_CHUNKED => {
            let chunk = chunk.max(1);
            let span = chunk * incr;
            let stride = span * num_threads as i32;
            let new_lower = lower + span * thread_num as i32;
            let new_upper = new_lower + span - incr;
            let last_iter =
                thread_num == ((trip_count - 1) / chunk as u32) % num_threads;
            Ok(StaticForBounds {
                lower: new_lower,
                upper: new_upper,
                stride,
                last_iter,
            })
        }

        SCH_STATIC => {
            let (new_lower, new_upper, last_iter) = if trip_count < num_threads {
                // Fewer iterations than threads: the first trip_count
                // threads take one each, the rest get an empty range.
                if thread_num < trip_count {
                    let bound = lower + thread_num as i32 * incr;
                    (bound, bound, thread_num == trip_count - 1)
                } else {
                    (upper + incr, upper, thread_num == trip_count.wrapping_sub(1))
                }
            } else {
                let small_chunk = trip_count / num_threads;
                let extras = trip_count % num_threads;
                let new_lower = lower
                    + incr
                        * (thread_num * small_chunk + thread_num.min(extras)) as i32;
                let new_upper = new_lower + small_chunk as i32 * incr
                    - if thread_num < extras { 0 } else { incr };
                (new_lower, new_upper, thread_num == num_threads - 1)
            };
            Ok(StaticForBounds {
                lower: new_lower,
                upper: new_upper,
                stride: trip_count as i32,
                last_iter,
            })
        }

        other => Err(Trap::UnimplementedSchedule { schedule: other }),
    }
}
