//! I/O host calls
//!
//! The guest sees a tiny read-only corner of the filesystem: `/etc/hosts`
//! and `/etc/resolv.conf`, each mapped to a fixed host file from the
//! configuration. Every descriptor handed out here is owned by the calling
//! thread; everything else fails.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

use tracing::{debug, warn};

use crate::sandbox::error::{Trap, TrapResult};
use crate::sandbox::fd_table;
use crate::sandbox::module::ExecutionContext;

use super::HostCallTable;

pub(super) fn register(table: &mut HostCallTable) {
    table.register("__syscall_open", 3, sys_open);
    table.register("__syscall_read", 3, sys_read);
    table.register("__syscall_close", 1, sys_close);
    table.register("__syscall_fcntl64", 3, sys_fcntl64);
    table.register("__syscall_poll", 3, sys_poll);
    table.register("ioctl", 3, intrinsic_ioctl);
    table.register("__syscall_ioctl", 6, sys_ioctl);
    table.register("puts", 1, intrinsic_puts);
    table.register("__syscall_writev", 3, sys_writev);
    table.register("_gethostbyname", 1, intrinsic_gethostbyname);

    table.register("__syscall_readv", 3, |_, args| unsupported("readv", args));
    table.register("__syscall_llseek", 5, |_, args| unsupported("llseek", args));
    table.register("__syscall_futex", 6, |_, args| unsupported("futex", args));
    table.register("__syscall_fstat64", 2, |_, args| unsupported("fstat64", args));
    table.register("__syscall_stat64", 2, |_, args| unsupported("stat64", args));
    table.register("__syscall_access", 2, |_, args| unsupported("access", args));
    table.register("__syscall_exit", 1, |_, args| unsupported("exit", args));
    table.register("__syscall_exit_group", 1, |_, args| {
        unsupported("exit_group", args)
    });
    table.register("__syscall_gettid", 1, |_, args| unsupported("gettid", args));
    table.register("__syscall_tkill", 2, |_, args| unsupported("tkill", args));
    table.register("__syscall_rt_sigprocmask", 3, |_, args| {
        unsupported("rt_sigprocmask", args)
    });
    table.register("__unsupported_syscall", 7, |_, args| {
        unsupported("unsupported_syscall", args)
    });
}

fn unsupported(name: &'static str, args: &[i32]) -> TrapResult<i32> {
    debug!("S - {} {:?}", name, args);
    Err(Trap::unimplemented(name))
}

/// Whitelisted read-only open
fn sys_open(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (path_ptr, flags, mode) = (args[0], args[1], args[2]);
    debug!("S - open {} {} {}", path_ptr, flags, mode);

    if mode != 0 {
        warn!("open in non-read-only mode ({})", mode);
        return Err(Trap::ModeRejected { mode });
    }

    let path = ctx.memory().read_c_string(path_ptr as u32)?;
    let host_path = match path.as_str() {
        "/etc/hosts" => &ctx.config.hosts_file,
        "/etc/resolv.conf" => &ctx.config.resolv_file,
        _ => {
            warn!("open of blocked path {}", path);
            return Err(Trap::PathBlocked { path });
        }
    };
    debug!("opening mapped {} for guest {}", host_path.display(), path);

    let c_path = CString::new(host_path.as_os_str().as_bytes())
        .map_err(|_| Trap::PathBlocked { path: path.clone() })?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
    if fd > 0 {
        fd_table::insert(fd);
        Ok(fd)
    } else {
        warn!("host file {} missing for {}", host_path.display(), path);
        Err(Trap::PathBlocked { path })
    }
}

fn sys_read(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (fd, buf_ptr, count) = (args[0], args[1], args[2]);
    debug!("S - read {} {} {}", fd, buf_ptr, count);

    fd_table::check_owned(fd)?;
    let buf = ctx.memory().slice_mut(buf_ptr as u32, count as u32)?;
    let bytes_read =
        unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, count as usize) };
    Ok(bytes_read as i32)
}

fn sys_close(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let fd = args[0];
    debug!("S - close {}", fd);

    fd_table::check_owned(fd)?;
    fd_table::remove(fd);
    unsafe { libc::close(fd) };
    Ok(0)
}

/// Many fcntl operations are irrelevant inside the sandbox; ownership is
/// still enforced.
fn sys_fcntl64(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (fd, cmd, arg) = (args[0], args[1], args[2]);
    debug!("S - fcntl64 {} {} {}", fd, cmd, arg);

    fd_table::check_owned(fd)?;
    Ok(0)
}

/// Single-descriptor poll, delegated to the host
fn sys_poll(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (fds_ptr, nfds, timeout) = (args[0], args[1], args[2]);
    debug!("S - poll {} {} {}", fds_ptr, nfds, timeout);

    if nfds != 1 {
        warn!("poll of {} fds, only a single fd is supported", nfds);
        return Err(Trap::unimplemented("poll with nfds != 1"));
    }

    let memory = ctx.memory();
    let fd = memory.read_i32(fds_ptr as u32)?;
    let events = memory.read_i16(fds_ptr as u32 + 4)?;
    fd_table::check_owned(fd)?;

    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout) };

    memory.write_i16(fds_ptr as u32 + 6, pollfd.revents)?;
    Ok(result)
}

fn intrinsic_ioctl(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!("I - ioctl {} {} {}", args[0], args[1], args[2]);
    Ok(0)
}

fn sys_ioctl(_ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    debug!(
        "S - ioctl {} {} {} {} {} {}",
        args[0], args[1], args[2], args[3], args[4], args[5]
    );
    Ok(0)
}

fn intrinsic_puts(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let string = ctx.memory().read_c_string(args[0] as u32)?;
    debug!("I - puts {}", string);
    Ok(0)
}

/// Gathered write to host stdout, straight out of guest memory
fn sys_writev(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (fd, iov, iovcnt) = (args[0], args[1], args[2]);
    debug!("S - writev {} {} {}", fd, iov, iovcnt);

    let memory = ctx.memory();
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(iovcnt.max(0) as usize);
    for i in 0..iovcnt.max(0) as u32 {
        let base = memory.read_u32(iov as u32 + i * 8)?;
        let len = memory.read_u32(iov as u32 + i * 8 + 4)?;
        let slice = memory.slice(base, len)?;
        iovecs.push(libc::iovec {
            iov_base: slice.as_ptr() as *mut libc::c_void,
            iov_len: len as usize,
        });
    }

    let count = unsafe { libc::writev(libc::STDOUT_FILENO, iovecs.as_ptr(), iovcnt) };
    Ok(count as i32)
}

fn intrinsic_gethostbyname(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let hostname = ctx.memory().read_c_string(args[0] as u32)?;
    debug!("I - gethostbyname {}", hostname);
    Ok(0)
}
