//! Socket host calls
//!
//! `socketcall` is a multiplexed entry: the sub-call number selects the
//! operation and the arguments live in an array in guest memory. Functions
//! are expected to be network clients only, so the server-side sub-calls
//! are refused outright. Properly isolated functions run in their own
//! network namespace, which is what makes passing the client calls through
//! acceptable.

use tracing::{debug, warn};

use crate::sandbox::error::{Trap, TrapResult};
use crate::sandbox::fd_table;
use crate::sandbox::memory::GuestMemory;
use crate::sandbox::module::ExecutionContext;

use super::HostCallTable;

const SC_SOCKET: i32 = 1;
const SC_BIND: i32 = 2;
const SC_CONNECT: i32 = 3;
const SC_LISTEN: i32 = 4;
const SC_ACCEPT: i32 = 5;
const SC_GETSOCKNAME: i32 = 6;
const SC_GETPEERNAME: i32 = 7;
const SC_SOCKETPAIR: i32 = 8;
const SC_SEND: i32 = 9;
const SC_RECV: i32 = 10;
const SC_SENDTO: i32 = 11;
const SC_RECVFROM: i32 = 12;
const SC_SHUTDOWN: i32 = 13;
const SC_SETSOCKOPT: i32 = 14;
const SC_GETSOCKOPT: i32 = 15;
const SC_SENDMSG: i32 = 16;
const SC_RECVMSG: i32 = 17;
const SC_ACCEPT4: i32 = 18;
const SC_RECVMMSG: i32 = 19;
const SC_SENDMMSG: i32 = 20;

pub(super) fn register(table: &mut HostCallTable) {
    table.register("__syscall_socketcall", 2, sys_socketcall);
}

/// Guest sockaddr layout: u16 family then 14 opaque bytes
fn read_sockaddr(memory: &GuestMemory, addr_ptr: u32) -> TrapResult<libc::sockaddr> {
    let family = memory.read_i16(addr_ptr)? as u16;
    let data = memory.slice(addr_ptr + 2, 14)?;

    let mut sockaddr: libc::sockaddr = unsafe { std::mem::zeroed() };
    sockaddr.sa_family = family as libc::sa_family_t;
    for (i, byte) in data.iter().enumerate() {
        sockaddr.sa_data[i] = *byte as libc::c_char;
    }
    Ok(sockaddr)
}

/// Several calls modify the sockaddr in place on the host side; the guest
/// copy must reflect that.
fn write_sockaddr(
    memory: &GuestMemory,
    sockaddr: &libc::sockaddr,
    addr_ptr: u32,
) -> TrapResult<()> {
    memory.write_i16(addr_ptr, sockaddr.sa_family as i16)?;
    let data = memory.slice_mut(addr_ptr + 2, 14)?;
    for (i, byte) in sockaddr.sa_data.iter().enumerate() {
        data[i] = *byte as u8;
    }
    Ok(())
}

fn write_socklen(memory: &GuestMemory, len: libc::socklen_t, len_ptr: u32) -> TrapResult<()> {
    memory.write_i32(len_ptr, len as i32)
}

fn sys_socketcall(ctx: &ExecutionContext, args: &[i32]) -> TrapResult<i32> {
    let (call, args_ptr) = (args[0], args[1] as u32);
    let memory = ctx.memory();

    match call {
        SC_SOCKET => {
            let sub = memory.read_u32_vec(args_ptr, 3)?;
            let (domain, sock_type, protocol) = (sub[0] as i32, sub[1] as i32, sub[2] as i32);
            debug!("S - socket {} {} {}", domain, sock_type, protocol);

            let sock = unsafe { libc::socket(domain, sock_type, protocol) };
            if sock >= 0 {
                fd_table::insert(sock);
            }
            Ok(sock)
        }

        SC_CONNECT => {
            let sub = memory.read_u32_vec(args_ptr, 3)?;
            let (sockfd, addr_ptr, addr_len) = (sub[0] as i32, sub[1], sub[2]);
            debug!("S - connect {} {} {}", sockfd, addr_ptr, addr_len);

            fd_table::check_owned(sockfd)?;
            let sockaddr = read_sockaddr(memory, addr_ptr)?;
            let result = unsafe {
                libc::connect(
                    sockfd,
                    &sockaddr,
                    std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
                )
            };
            Ok(result)
        }

        SC_BIND => {
            let sub = memory.read_u32_vec(args_ptr, 3)?;
            let (sockfd, addr_ptr, addr_len) = (sub[0] as i32, sub[1], sub[2]);
            debug!("S - bind {} {} {}", sockfd, addr_ptr, addr_len);

            fd_table::check_owned(sockfd)?;
            let sockaddr = read_sockaddr(memory, addr_ptr)?;
            let result = unsafe {
                libc::bind(
                    sockfd,
                    &sockaddr,
                    std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
                )
            };
            Ok(result)
        }

        SC_GETSOCKNAME => {
            let sub = memory.read_u32_vec(args_ptr, 3)?;
            let (sockfd, addr_ptr, len_ptr) = (sub[0] as i32, sub[1], sub[2]);
            debug!("S - getsockname {} {} {}", sockfd, addr_ptr, len_ptr);

            fd_table::check_owned(sockfd)?;
            let mut sockaddr = read_sockaddr(memory, addr_ptr)?;
            let mut native_len = std::mem::size_of::<libc::sockaddr>() as libc::socklen_t;
            let result = unsafe { libc::getsockname(sockfd, &mut sockaddr, &mut native_len) };

            write_sockaddr(memory, &sockaddr, addr_ptr)?;
            write_socklen(memory, native_len, len_ptr)?;
            Ok(result)
        }

        SC_SEND | SC_RECV | SC_SENDTO | SC_RECVFROM => {
            let arg_count = if call == SC_SENDTO || call == SC_RECVFROM {
                6
            } else {
                4
            };
            let sub = memory.read_u32_vec(args_ptr, arg_count)?;
            let (sockfd, buf_ptr, buf_len, flags) =
                (sub[0] as i32, sub[1], sub[2], sub[3] as i32);

            fd_table::check_owned(sockfd)?;
            let buf = memory.slice_mut(buf_ptr, buf_len)?;
            let buf_ptr_host = buf.as_mut_ptr() as *mut libc::c_void;
            let buf_len_host = buf_len as usize;

            let result = match call {
                SC_SEND => {
                    debug!("S - send {} {} {} {}", sockfd, buf_ptr, buf_len, flags);
                    unsafe { libc::send(sockfd, buf_ptr_host, buf_len_host, flags) }
                }
                SC_RECV => {
                    debug!("S - recv {} {} {} {}", sockfd, buf_ptr, buf_len, flags);
                    unsafe { libc::recv(sockfd, buf_ptr_host, buf_len_host, flags) }
                }
                SC_SENDTO => {
                    let (addr_ptr, addr_len) = (sub[4], sub[5]);
                    debug!(
                        "S - sendto {} {} {} {} {} {}",
                        sockfd, buf_ptr, buf_len, flags, addr_ptr, addr_len
                    );
                    let sockaddr = read_sockaddr(memory, addr_ptr)?;
                    unsafe {
                        libc::sendto(
                            sockfd,
                            buf_ptr_host,
                            buf_len_host,
                            flags,
                            &sockaddr,
                            std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
                        )
                    }
                }
                _ => {
                    // recvfrom: the final argument is a pointer to the length
                    let (addr_ptr, len_ptr) = (sub[4], sub[5]);
                    debug!(
                        "S - recvfrom {} {} {} {} {} {}",
                        sockfd, buf_ptr, buf_len, flags, addr_ptr, len_ptr
                    );
                    let mut sockaddr = read_sockaddr(memory, addr_ptr)?;
                    let mut native_len = std::mem::size_of::<libc::sockaddr>() as libc::socklen_t;
                    let received = unsafe {
                        libc::recvfrom(
                            sockfd,
                            buf_ptr_host,
                            buf_len_host,
                            flags,
                            &mut sockaddr,
                            &mut native_len,
                        )
                    };
                    // The host fills the sockaddr and length in place
                    write_sockaddr(memory, &sockaddr, addr_ptr)?;
                    write_socklen(memory, native_len, len_ptr)?;
                    received
                }
            };
            Ok(result as i32)
        }

        SC_ACCEPT | SC_LISTEN => {
            // Server-side; functions are clients only
            let name = if call == SC_ACCEPT { "accept" } else { "listen" };
            debug!("S - {} {} {}", name, call, args_ptr);
            Err(Trap::unimplemented(format!("socketcall {}", name)))
        }

        SC_GETPEERNAME | SC_SOCKETPAIR | SC_SHUTDOWN | SC_SETSOCKOPT | SC_GETSOCKOPT
        | SC_SENDMSG | SC_RECVMSG | SC_ACCEPT4 | SC_RECVMMSG | SC_SENDMMSG => {
            let name = match call {
                SC_GETPEERNAME => "getpeername",
                SC_SOCKETPAIR => "socketpair",
                SC_SHUTDOWN => "shutdown",
                SC_SETSOCKOPT => "setsockopt",
                SC_GETSOCKOPT => "getsockopt",
                SC_SENDMSG => "sendmsg",
                SC_RECVMSG => "recvmsg",
                SC_ACCEPT4 => "accept4",
                SC_RECVMMSG => "recvmmsg",
                _ => "sendmmsg",
            };
            warn!("S - {} {} stubbed, returning 0", name, args_ptr);
            Ok(0)
        }

        other => {
            warn!("unrecognised socketcall {}", other);
            Ok(0)
        }
    }
}
