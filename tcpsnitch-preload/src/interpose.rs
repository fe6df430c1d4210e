// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Lazy resolution of the real libc entry points this library shadows.
//!
//! Each real symbol is looked up once via `dlsym(RTLD_NEXT, ...)` and cached
//! in a process-wide `OnceLock`, the same one-shot-then-cache shape used for
//! resolving optional runtime entry points elsewhere in this codebase.

use std::ffi::CStr;
use std::sync::OnceLock;

/// Resolves `$name`'s real implementation, caching it in a private
/// `OnceLock`. `dlsym` against `RTLD_NEXT` is how an interposing shared
/// object reaches "the next definition of this symbol in the search order",
/// i.e. the libc the host process actually linked against.
///
/// If resolution ever fails — a host linked against an exotic libc missing
/// one of these entry points — the library logs it and falls back to a
/// stand-in that fails the call with `ENOSYS` rather than the real
/// implementation. A wrapped entry point is always called from across an
/// `extern "C"` boundary with no unwinding landing pad on the other side, so
/// this path must never panic: an unresolvable symbol degrades the feature,
/// it does not bring down the host process.
macro_rules! real_symbol {
    ($fn_name:ident, $name:literal, fn($($arg:ty),* $(,)?) -> $ret:ty) => {
        pub fn $fn_name() -> unsafe extern "C" fn($($arg),*) -> $ret {
            static CELL: OnceLock<usize> = OnceLock::new();
            let addr = *CELL.get_or_init(|| unsafe {
                let sym = CStr::from_bytes_with_nul(concat!($name, "\0").as_bytes())
                    .expect("symbol name is a valid C string");
                let ptr = libc::dlsym(libc::RTLD_NEXT, sym.as_ptr());
                if ptr.is_null() {
                    tracing::error!(
                        symbol = $name,
                        "dlsym(RTLD_NEXT) could not resolve the real libc entry point; \
                         calls to it will fail with ENOSYS instead of reaching libc"
                    );
                    unsafe extern "C" fn fallback($(_: $arg),*) -> $ret {
                        *libc::__errno_location() = libc::ENOSYS;
                        -1 as $ret
                    }
                    fallback as usize
                } else {
                    ptr as usize
                }
            });
            unsafe { std::mem::transmute::<usize, unsafe extern "C" fn($($arg),*) -> $ret>(addr) }
        }
    };
}

real_symbol!(
    real_socket,
    "socket",
    fn(libc::c_int, libc::c_int, libc::c_int) -> libc::c_int
);
real_symbol!(
    real_bind,
    "bind",
    fn(libc::c_int, *const libc::sockaddr, libc::socklen_t) -> libc::c_int
);
real_symbol!(
    real_connect,
    "connect",
    fn(libc::c_int, *const libc::sockaddr, libc::socklen_t) -> libc::c_int
);
real_symbol!(
    real_shutdown,
    "shutdown",
    fn(libc::c_int, libc::c_int) -> libc::c_int
);
real_symbol!(
    real_listen,
    "listen",
    fn(libc::c_int, libc::c_int) -> libc::c_int
);
real_symbol!(
    real_setsockopt,
    "setsockopt",
    fn(
        libc::c_int,
        libc::c_int,
        libc::c_int,
        *const libc::c_void,
        libc::socklen_t,
    ) -> libc::c_int
);
real_symbol!(
    real_send,
    "send",
    fn(libc::c_int, *const libc::c_void, libc::size_t, libc::c_int) -> isize
);
real_symbol!(
    real_recv,
    "recv",
    fn(libc::c_int, *mut libc::c_void, libc::size_t, libc::c_int) -> isize
);
real_symbol!(
    real_sendto,
    "sendto",
    fn(
        libc::c_int,
        *const libc::c_void,
        libc::size_t,
        libc::c_int,
        *const libc::sockaddr,
        libc::socklen_t,
    ) -> isize
);
real_symbol!(
    real_recvfrom,
    "recvfrom",
    fn(
        libc::c_int,
        *mut libc::c_void,
        libc::size_t,
        libc::c_int,
        *mut libc::sockaddr,
        *mut libc::socklen_t,
    ) -> isize
);
real_symbol!(
    real_sendmsg,
    "sendmsg",
    fn(libc::c_int, *const libc::msghdr, libc::c_int) -> isize
);
real_symbol!(
    real_recvmsg,
    "recvmsg",
    fn(libc::c_int, *mut libc::msghdr, libc::c_int) -> isize
);
real_symbol!(
    real_write,
    "write",
    fn(libc::c_int, *const libc::c_void, libc::size_t) -> isize
);
real_symbol!(
    real_read,
    "read",
    fn(libc::c_int, *mut libc::c_void, libc::size_t) -> isize
);
real_symbol!(real_close, "close", fn(libc::c_int) -> libc::c_int);
real_symbol!(
    real_writev,
    "writev",
    fn(libc::c_int, *const libc::iovec, libc::c_int) -> isize
);
real_symbol!(
    real_readv,
    "readv",
    fn(libc::c_int, *mut libc::iovec, libc::c_int) -> isize
);
real_symbol!(real_fork, "fork", fn() -> libc::pid_t);
real_symbol!(
    real_getsockname,
    "getsockname",
    fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int
);
real_symbol!(
    real_getsockopt,
    "getsockopt",
    fn(
        libc::c_int,
        libc::c_int,
        libc::c_int,
        *mut libc::c_void,
        *mut libc::socklen_t,
    ) -> libc::c_int
);
