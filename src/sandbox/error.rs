//! Sandbox error taxonomy
//!
//! Every fatal condition inside a host call surfaces as a [`Trap`], which
//! aborts the current invocation and is reported to the invoker as a
//! non-zero return code.

use std::fmt;

/// Result type for sandbox and host-call operations
pub type TrapResult<T> = Result<T, Trap>;

/// Conditions that tear an invocation down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// Guest address range is outside the current memory size
    GuestBounds {
        addr: u32,
        len: u32,
        memory_size: u32,
    },

    /// Descriptor is not in the calling thread's ownership table
    FdNotOwned {
        fd: i32,
    },

    /// Guest tried to open a path outside the whitelist
    PathBlocked {
        path: String,
    },

    /// Guest tried to open in a non-read-only mode
    ModeRejected {
        mode: i32,
    },

    /// Syscall or sub-call that the sandbox does not support
    Unimplemented {
        name: String,
    },

    /// Static-for schedule code with no implementation
    UnimplementedSchedule {
        schedule: i32,
    },

    /// One or more forked OMP threads returned a non-zero code
    OmpChildrenFailed {
        errors: u32,
    },

    /// Chained child result did not arrive in time
    TransportTimeout {
        call_id: u64,
    },

    /// Bus or state transport failed outright
    TransportError {
        reason: String,
    },

    /// A state backend was required but could not be used
    StateUnavailable {
        reason: String,
    },

    /// Guest memory growth past the module's maximum
    OutOfMemory {
        requested_pages: u32,
        max_pages: u32,
    },
}

impl Trap {
    pub fn unimplemented(name: impl Into<String>) -> Self {
        Self::Unimplemented { name: name.into() }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GuestBounds {
                addr,
                len,
                memory_size,
            } => {
                write!(
                    f,
                    "guest access out of bounds: addr {} + len {} > memory size {}",
                    addr, len, memory_size
                )
            }
            Self::FdNotOwned { fd } => {
                write!(f, "fd {} not owned by this thread", fd)
            }
            Self::PathBlocked { path } => {
                write!(f, "open of blocked path: {}", path)
            }
            Self::ModeRejected { mode } => {
                write!(f, "open in non-read-only mode ({})", mode)
            }
            Self::Unimplemented { name } => {
                write!(f, "unimplemented host call: {}", name)
            }
            Self::UnimplementedSchedule { schedule } => {
                write!(f, "unimplemented loop schedule: {}", schedule)
            }
            Self::OmpChildrenFailed { errors } => {
                write!(f, "{} OMP threads exited with errors", errors)
            }
            Self::TransportTimeout { call_id } => {
                write!(f, "timed out waiting for chained call {}", call_id)
            }
            Self::TransportError { reason } => {
                write!(f, "transport error: {}", reason)
            }
            Self::StateUnavailable { reason } => {
                write!(f, "state backend unavailable: {}", reason)
            }
            Self::OutOfMemory {
                requested_pages,
                max_pages,
            } => {
                write!(
                    f,
                    "guest memory exhausted: requested {} pages, max {}",
                    requested_pages, max_pages
                )
            }
        }
    }
}

impl std::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_display() {
        let trap = Trap::FdNotOwned { fd: 7 };
        assert_eq!(trap.to_string(), "fd 7 not owned by this thread");

        let trap = Trap::PathBlocked {
            path: "/etc/passwd".to_string(),
        };
        assert_eq!(trap.to_string(), "open of blocked path: /etc/passwd");

        let trap = Trap::GuestBounds {
            addr: 1000,
            len: 64,
            memory_size: 512,
        };
        assert!(trap.to_string().contains("1000"));
        assert!(trap.to_string().contains("512"));
    }
}
