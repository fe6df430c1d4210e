// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Pure encoders: turning raw `sockaddr` buffers into the string forms the
//! event log records. These carry no interesting invariants of their own —
//! the spec explicitly treats host/port string building as an out-of-scope
//! "pure encoder" concern, implemented here as simple leaf functions.

use nix::sys::socket::SockaddrStorage;
use serde::Serialize;

/// A decoded peer or local address, as recorded on an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressInfo {
    pub family: i32,
    pub ip: String,
    pub port: u16,
}

impl AddressInfo {
    pub fn host_string(&self) -> String {
        self.ip.clone()
    }

    pub fn port_string(&self) -> String {
        self.port.to_string()
    }
}

/// Decodes a raw `sockaddr` buffer as passed to `bind`/`connect`/`sendto`/...
///
/// # Safety
/// `addr` must point to at least `len` readable bytes, as guaranteed by the
/// calling convention of the wrapped syscall itself (the post-hook reads the
/// same buffer the host passed to the real function).
pub unsafe fn decode_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<AddressInfo> {
    if addr.is_null() || len == 0 {
        return None;
    }
    let storage = unsafe { SockaddrStorage::from_raw(addr, Some(len)) }?;
    if let Some(v4) = storage.as_sockaddr_in() {
        return Some(AddressInfo {
            family: libc::AF_INET,
            ip: std::net::Ipv4Addr::from(v4.ip()).to_string(),
            port: v4.port(),
        });
    }
    if let Some(v6) = storage.as_sockaddr_in6() {
        return Some(AddressInfo {
            family: libc::AF_INET6,
            ip: v6.ip().to_string(),
            port: v6.port(),
        });
    }
    None
}

/// Builds an `AddressInfo` directly from a parsed `std::net::SocketAddr`,
/// used by the forced-bind path which picks the local port itself rather
/// than decoding a host-supplied buffer.
pub fn address_info_from_std(addr: std::net::SocketAddr) -> AddressInfo {
    AddressInfo {
        family: if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        },
        ip: addr.ip().to_string(),
        port: addr.port(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;
    use std::net::Ipv4Addr;

    #[test]
    fn decodes_ipv4_sockaddr() {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 80u16.to_be();
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::new(93, 184, 216, 34)).to_be();

        let info = unsafe {
            decode_sockaddr(
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        .expect("should decode");

        assert_eq!(info.family, libc::AF_INET);
        assert_eq!(info.ip, "93.184.216.34");
        assert_eq!(info.port, 80);
    }

    #[test]
    fn null_pointer_decodes_to_none() {
        assert!(unsafe { decode_sockaddr(std::ptr::null(), 0) }.is_none());
    }
}
