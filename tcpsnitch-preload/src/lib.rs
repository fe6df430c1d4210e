// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! The symbol interposer: the 18 wrapped socket/IO entry points plus
//! `fork`, exported under their original libc names so the dynamic linker
//! resolves a preloading process's calls to this library instead.
//!
//! Every wrapper follows the same shape: resolve the real function once,
//! trigger one-time library init if needed, call through unchanged,
//! capture the return value and errno, invoke the matching post-hook, then
//! restore errno and return the real value to the caller untouched.

mod interpose;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Once;

use tcpsnitch_common::address::{self, AddressInfo};
use tcpsnitch_common::flags;
use tcpsnitch_core::event::TcpInfoSnapshot;
use tcpsnitch_core::hooks::{self, RawOps};
use tcpsnitch_core::lifecycle::{self, Runtime};

static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());
static INIT_ONCE: Once = Once::new();

fn runtime() -> &'static Runtime {
    INIT_ONCE.call_once(|| {
        let rt = Box::new(lifecycle::init());
        RUNTIME.store(Box::into_raw(rt), Ordering::SeqCst);
    });
    // Safety: once stored, a Runtime pointer is never freed; it is only
    // replaced (and leaked) by `reset_runtime` on the fork path.
    unsafe { &*RUNTIME.load(Ordering::SeqCst) }
}

/// Swaps in a freshly reset runtime. The previous one is intentionally
/// leaked rather than dropped: other threads (in the pre-fork parent, never
/// in this child) may still hold references into it, and a `fork`'d child
/// starts single-threaded, so nothing but this thread will ever touch the
/// new pointer before the next init.
fn reset_runtime() {
    let rt = Box::new(lifecycle::reset());
    let old = RUNTIME.swap(Box::into_raw(rt), Ordering::SeqCst);
    let _ = old;
}

fn errno_string(success: bool) -> Option<String> {
    if success {
        return None;
    }
    Some(std::io::Error::last_os_error().to_string())
}

/// Captures the current `errno` value. Post-hooks may themselves issue
/// syscalls (capture setup, `tcp_info` queries, file I/O for flushing) that
/// overwrite it; the interposer must restore the value the real call left
/// behind before returning to the host, which never sees any trace of the
/// library's own work.
fn save_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn restore_errno(value: i32) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

struct LibcRawOps;

fn sockaddr_in_from_std(addr: SocketAddr) -> Option<(libc::sockaddr_in, libc::socklen_t)> {
    let SocketAddr::V4(v4) = addr else {
        return None;
    };
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = v4.port().to_be();
    sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
    Some((sin, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
}

impl RawOps for LibcRawOps {
    fn bind(&self, fd: RawFd, addr: SocketAddr) -> nix::Result<()> {
        let Some((sin, len)) = sockaddr_in_from_std(addr) else {
            return Err(nix::errno::Errno::EAFNOSUPPORT);
        };
        let rc = unsafe {
            interpose::real_bind()(fd, &sin as *const _ as *const libc::sockaddr, len)
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(nix::errno::Errno::last())
        }
    }

    fn local_addr(&self, fd: RawFd) -> Option<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            interpose::real_getsockname()(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return None;
        }
        let info = unsafe {
            address::decode_sockaddr(&storage as *const _ as *const libc::sockaddr, len)
        }?;
        let ip: std::net::IpAddr = info.ip.parse().ok()?;
        Some(SocketAddr::new(ip, info.port))
    }

    fn tcp_info(&self, fd: RawFd) -> Option<TcpInfoSnapshot> {
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let rc = unsafe {
            interpose::real_getsockopt()(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        Some(TcpInfoSnapshot {
            state: info.tcpi_state,
            rtt_usec: info.tcpi_rtt,
            rtt_var_usec: info.tcpi_rttvar,
            snd_cwnd: info.tcpi_snd_cwnd,
            retransmits: info.tcpi_retransmits as u32,
            total_retrans: info.tcpi_total_retrans,
        })
    }
}

static RAW_OPS: LibcRawOps = LibcRawOps;

fn hook_context() -> hooks::HookContext<'static> {
    runtime().hook_context(&RAW_OPS)
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: libc::c_int, type_: libc::c_int, protocol: libc::c_int) -> libc::c_int {
    let fd = interpose::real_socket()(domain, type_, protocol);
    let errno = save_errno();
    if fd >= 0 {
        let ctx = hook_context();
        let id = runtime().next_connection_id();
        hooks::socket_post(&ctx, fd, id, domain, type_, protocol);
    }
    restore_errno(errno);
    fd
}

#[no_mangle]
pub unsafe extern "C" fn bind(
    sockfd: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::c_int {
    let rc = interpose::real_bind()(sockfd, addr, addrlen);
    let success = rc == 0;
    let error = errno_string(success);
    let errno = save_errno();
    if let Some(info) = address::decode_sockaddr(addr, addrlen) {
        let ctx = hook_context();
        hooks::bind_post(&ctx, sockfd, rc as i64, success, error, &info, false);
    }
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::c_int {
    let rc = interpose::real_connect()(sockfd, addr, addrlen);
    let success = rc == 0;
    let error = errno_string(success);
    let errno = save_errno();
    if let Some(info) = address::decode_sockaddr(addr, addrlen) {
        let ctx = hook_context();
        hooks::connect_post(&ctx, sockfd, rc as i64, success, error, &info);
    }
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn shutdown(sockfd: libc::c_int, how: libc::c_int) -> libc::c_int {
    let rc = interpose::real_shutdown()(sockfd, how);
    let success = rc == 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::shutdown_post(&ctx, sockfd, rc as i64, success, error, how);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn listen(sockfd: libc::c_int, backlog: libc::c_int) -> libc::c_int {
    let rc = interpose::real_listen()(sockfd, backlog);
    let success = rc == 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::listen_post(&ctx, sockfd, rc as i64, success, error, backlog);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    let rc = interpose::real_setsockopt()(sockfd, level, optname, optval, optlen);
    let success = rc == 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::setsockopt_post(&ctx, sockfd, rc as i64, success, error, level, optname);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn send(
    sockfd: libc::c_int,
    buf: *const libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> isize {
    let rc = interpose::real_send()(sockfd, buf, len, flags);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::data_post(
        &ctx,
        sockfd,
        rc as i64,
        success,
        error,
        len as u64,
        true,
        Some(flags::decode_message_flags(flags)),
    );
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn recv(
    sockfd: libc::c_int,
    buf: *mut libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> isize {
    let rc = interpose::real_recv()(sockfd, buf, len, flags);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::data_post(
        &ctx,
        sockfd,
        rc as i64,
        success,
        error,
        len as u64,
        false,
        Some(flags::decode_message_flags(flags)),
    );
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: libc::c_int,
    buf: *const libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let rc = interpose::real_sendto()(sockfd, buf, len, flags, dest_addr, addrlen);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let addr = address::decode_sockaddr(dest_addr, addrlen);
    let ctx = hook_context();
    hooks::addr_data_post(
        &ctx,
        sockfd,
        rc as i64,
        success,
        error,
        addr,
        len as u64,
        true,
        flags::decode_message_flags(flags),
    );
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: libc::c_int,
    buf: *mut libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let rc = interpose::real_recvfrom()(sockfd, buf, len, flags, src_addr, addrlen);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let addr = if addrlen.is_null() {
        None
    } else {
        address::decode_sockaddr(src_addr as *const libc::sockaddr, *addrlen)
    };
    let ctx = hook_context();
    hooks::addr_data_post(
        &ctx,
        sockfd,
        rc as i64,
        success,
        error,
        addr,
        len as u64,
        false,
        flags::decode_message_flags(flags),
    );
    restore_errno(errno);
    rc
}

unsafe fn iovec_sizes(iov: *const libc::iovec, count: libc::c_int) -> Vec<usize> {
    if iov.is_null() || count <= 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(iov, count as usize)
        .iter()
        .map(|v| v.iov_len)
        .collect()
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(sockfd: libc::c_int, msg: *const libc::msghdr, flags: libc::c_int) -> isize {
    let rc = interpose::real_sendmsg()(sockfd, msg, flags);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let (addr, has_control, sizes) = decode_msghdr(msg);
    let ctx = hook_context();
    hooks::msghdr_post(&ctx, sockfd, rc as i64, success, error, addr, has_control, sizes, true);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: libc::c_int, msg: *mut libc::msghdr, flags: libc::c_int) -> isize {
    let rc = interpose::real_recvmsg()(sockfd, msg, flags);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let (addr, has_control, sizes) = decode_msghdr(msg as *const libc::msghdr);
    let ctx = hook_context();
    hooks::msghdr_post(&ctx, sockfd, rc as i64, success, error, addr, has_control, sizes, false);
    restore_errno(errno);
    rc
}

unsafe fn decode_msghdr(msg: *const libc::msghdr) -> (Option<AddressInfo>, bool, Vec<usize>) {
    if msg.is_null() {
        return (None, false, Vec::new());
    }
    let msg = &*msg;
    let addr = if msg.msg_name.is_null() || msg.msg_namelen == 0 {
        None
    } else {
        address::decode_sockaddr(msg.msg_name as *const libc::sockaddr, msg.msg_namelen)
    };
    let has_control = !msg.msg_control.is_null() && msg.msg_controllen > 0;
    let sizes = iovec_sizes(msg.msg_iov, msg.msg_iovlen as libc::c_int);
    (addr, has_control, sizes)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: libc::c_int, buf: *const libc::c_void, count: libc::size_t) -> isize {
    let rc = interpose::real_write()(fd, buf, count);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::data_post(&ctx, fd, rc as i64, success, error, count as u64, true, None);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: libc::c_int, buf: *mut libc::c_void, count: libc::size_t) -> isize {
    let rc = interpose::real_read()(fd, buf, count);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::data_post(&ctx, fd, rc as i64, success, error, count as u64, false, None);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: libc::c_int, iov: *const libc::iovec, iovcnt: libc::c_int) -> isize {
    let rc = interpose::real_writev()(fd, iov, iovcnt);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let sizes = iovec_sizes(iov, iovcnt);
    let ctx = hook_context();
    hooks::vec_post(&ctx, fd, rc as i64, success, error, sizes, true);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: libc::c_int, iov: *mut libc::iovec, iovcnt: libc::c_int) -> isize {
    let rc = interpose::real_readv()(fd, iov, iovcnt);
    let success = rc >= 0;
    let error = errno_string(success);
    let errno = save_errno();
    let sizes = iovec_sizes(iov as *const libc::iovec, iovcnt);
    let ctx = hook_context();
    hooks::vec_post(&ctx, fd, rc as i64, success, error, sizes, false);
    restore_errno(errno);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: libc::c_int) -> libc::c_int {
    let rc = interpose::real_close()(fd);
    let success = rc == 0;
    let error = errno_string(success);
    let errno = save_errno();
    let ctx = hook_context();
    hooks::close_post(&ctx, fd, rc as i64, success, error, false);
    restore_errno(errno);
    rc
}

/// The `fork` wrapper: in the child, the reset routine runs before any
/// other code, including the host's own post-fork logic, since libc runs
/// `pthread_atfork` child handlers before `fork(2)` returns to the caller.
#[no_mangle]
pub unsafe extern "C" fn fork() -> libc::pid_t {
    let pid = interpose::real_fork()();
    if pid == 0 {
        reset_runtime();
    }
    pid
}

/// Atexit sweep, run as the shared object is unloaded at process exit.
/// Only fires if the library was ever actually initialized (a process that
/// loaded this `.so` but never called a wrapped entry point has nothing to
/// sweep).
#[ctor::dtor]
fn atexit_cleanup() {
    if !lifecycle::is_initialized() {
        return;
    }
    lifecycle::cleanup(runtime());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_in_from_std_round_trips_ipv4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (sin, len) = sockaddr_in_from_std(addr).unwrap();
        assert_eq!(len, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
    }

    #[test]
    fn sockaddr_in_from_std_rejects_ipv6() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert!(sockaddr_in_from_std(addr).is_none());
    }
}
