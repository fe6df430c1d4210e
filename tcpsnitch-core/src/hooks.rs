// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Event factory and per-variant post-hooks.
//!
//! Every post-hook follows the same shape: locate the connection under the
//! descriptor table's slot lock, build the typed event, append it,
//! consider flushing, release the lock, then — outside the lock, since it
//! may itself re-enter wrapped entry points — consider the periodic
//! `tcp_info` trigger and the capture coordinator.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use tcpsnitch_common::address::{self, AddressInfo};
use tcpsnitch_common::flags::{self, MessageFlags};
use tcpsnitch_common::Config;

use crate::capture::{self, CaptureHandle};
use crate::connection::Connection;
use crate::event::*;
use crate::table::DescriptorTable;

/// Syscalls a post-hook needs to perform itself, rather than through the
/// wrapped entry point directly, because the wrapped path would re-enter
/// this same module reentrantly (force-bind's `bind`) or because the value
/// has no event of its own (`tcp_info`, `getsockname`).
///
/// Implemented by the interposer crate against the real, dlsym-resolved
/// functions; a fake implementation backs the unit tests here.
pub trait RawOps {
    fn bind(&self, fd: RawFd, addr: SocketAddr) -> nix::Result<()>;
    fn local_addr(&self, fd: RawFd) -> Option<SocketAddr>;
    fn tcp_info(&self, fd: RawFd) -> Option<TcpInfoSnapshot>;
}

/// Everything a post-hook needs beyond the raw event arguments: the table
/// to look the connection up in, the active configuration, a connection-id
/// source for brand-new descriptors, and the raw syscall bridge.
pub struct HookContext<'a> {
    pub table: &'a DescriptorTable,
    pub config: &'a Config,
    pub directory: &'a PathBuf,
    pub raw: &'a dyn RawOps,
}

fn new_connection_directory(base: &PathBuf, id: u64) -> PathBuf {
    let dir = base.join(id.to_string());
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// `socket(domain, type, protocol)` post-hook. If `fd` already names a live
/// connection (a stale descriptor the kernel has recycled before we saw its
/// `close`), that record is finalized with a synthetic `close` first.
pub fn socket_post(
    ctx: &HookContext,
    fd: RawFd,
    connection_id: u64,
    domain: i32,
    type_arg: i32,
    protocol: i32,
) {
    if ctx.table.is_present(fd) {
        close_post(ctx, fd, 0, true, None, true);
    }
    let (socket_type, cloexec, nonblock) = flags::decode_socket_type(type_arg);
    let directory = new_connection_directory(ctx.directory, connection_id);
    let mut connection = Connection::new(connection_id, directory, ctx.config.dump_every_events());
    append_and_maybe_flush(
        ctx,
        &mut connection,
        fd,
        0,
        true,
        None,
        EventKind::Socket(SocketEvent {
            domain,
            socket_type,
            protocol,
            cloexec,
            nonblock,
        }),
    );
    ctx.table.put(fd, connection);
}

/// `bind(addr, len)` post-hook.
pub fn bind_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    addr: &AddressInfo,
    force_bind: bool,
) {
    ctx.table.with_slot(fd, |conn| {
        let Some(conn) = conn else { return };
        if success {
            conn.bound = true;
            conn.bound_addr = Some(addr.clone());
            conn.force_bind = force_bind;
        }
        conn.append(
            return_value,
            success,
            error,
            EventKind::Bind(BindEvent {
                addr: addr.clone(),
                host: addr.host_string(),
                port: addr.port_string(),
                force_bind,
            }),
        );
        maybe_flush(conn);
    });
    maybe_tcp_info(ctx, fd);
}

/// `connect(addr, len)` post-hook. On success this is also the trigger
/// point for starting packet capture, since it is the first event that
/// establishes a peer address on the socket.
pub fn connect_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    addr: &AddressInfo,
) {
    ctx.table.with_slot(fd, |conn| {
        let Some(conn) = conn else { return };
        conn.append(
            return_value,
            success,
            error,
            EventKind::Connect(ConnectEvent {
                addr: addr.clone(),
                host: addr.host_string(),
                port: addr.port_string(),
            }),
        );
        maybe_flush(conn);
    });
    maybe_tcp_info(ctx, fd);
    if success && ctx.config.capture_enabled() {
        maybe_start_capture(ctx, fd, addr);
    }
}

/// `shutdown(how)` post-hook.
pub fn shutdown_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    how: i32,
) {
    let (shut_rd, shut_wr) = flags::decode_shutdown_how(how);
    simple_event(
        ctx,
        fd,
        return_value,
        success,
        error,
        EventKind::Shutdown(ShutdownEvent {
            how,
            shut_rd,
            shut_wr,
        }),
    );
}

/// `listen(backlog)` post-hook.
pub fn listen_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    backlog: i32,
) {
    simple_event(
        ctx,
        fd,
        return_value,
        success,
        error,
        EventKind::Listen(ListenEvent { backlog }),
    );
}

/// `setsockopt(level, optname)` post-hook.
pub fn setsockopt_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    level: i32,
    optname: i32,
) {
    simple_event(
        ctx,
        fd,
        return_value,
        success,
        error,
        EventKind::Setsockopt(SetSockOptEvent {
            level,
            optname,
            protocol_name: flags::protocol_name(level).to_string(),
            option_name: flags::sockopt_name(level, optname).map(str::to_string),
        }),
    );
}

/// `send`/`write` style post-hook (no peer address, no msghdr).
pub fn data_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    bytes: u64,
    outbound: bool,
    flags: Option<MessageFlags>,
) {
    let kind = match (outbound, flags) {
        (true, Some(flags)) => EventKind::Send(MessageEvent { bytes, flags }),
        (false, Some(flags)) => EventKind::Recv(MessageEvent { bytes, flags }),
        (true, None) => EventKind::Write(DataEvent { bytes }),
        (false, None) => EventKind::Read(DataEvent { bytes }),
    };
    simple_event(ctx, fd, return_value, success, error, kind);
}

/// `sendto`/`recvfrom` post-hook.
pub fn addr_data_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    addr: Option<AddressInfo>,
    bytes: u64,
    outbound: bool,
    flags: MessageFlags,
) {
    let event = AddrMessageEvent { addr, bytes, flags };
    let kind = if outbound {
        EventKind::Sendto(event)
    } else {
        EventKind::Recvfrom(event)
    };
    simple_event(ctx, fd, return_value, success, error, kind);
}

/// `sendmsg`/`recvmsg` post-hook.
pub fn msghdr_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    addr: Option<AddressInfo>,
    has_control: bool,
    iovec_sizes: Vec<usize>,
    outbound: bool,
) {
    let bytes = iovec_sizes.iter().sum::<usize>() as u64;
    let event = MsgHdrEvent {
        addr,
        has_control,
        iovec_count: iovec_sizes.len(),
        iovec_sizes,
        bytes,
    };
    let kind = if outbound {
        EventKind::Sendmsg(event)
    } else {
        EventKind::Recvmsg(event)
    };
    simple_event(ctx, fd, return_value, success, error, kind);
}

/// `writev`/`readv` post-hook.
pub fn vec_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    iovec_sizes: Vec<usize>,
    outbound: bool,
) {
    let bytes = iovec_sizes.iter().sum::<usize>() as u64;
    let event = VecEvent {
        iovec_count: iovec_sizes.len(),
        iovec_sizes,
        bytes,
    };
    let kind = if outbound {
        EventKind::Writev(event)
    } else {
        EventKind::Readv(event)
    };
    simple_event(ctx, fd, return_value, success, error, kind);
}

/// `close` post-hook, explicit or synthetic. Drives the terminal flush:
/// the connection is removed from the table and its final flush (closing
/// the JSON array) is attempted before it is dropped. Any running capture
/// session is stopped first, delayed by `2 * rtt`.
pub fn close_post(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    detected: bool,
) {
    let Some(mut connection) = ctx.table.remove(fd) else {
        return;
    };
    connection.append(
        return_value,
        success,
        error,
        EventKind::Close(CloseEvent { detected }),
    );
    if let Some(capture) = connection.capture.take() {
        capture.stop(connection.rtt);
    }
    if let Err(err) = connection.flush(true) {
        tracing::warn!(fd, error = %err, "failed to finalize connection's event log");
    }
}

/// Shared body for post-hooks that need no special side effect beyond
/// "append, maybe flush, then consider `tcp_info`".
fn simple_event(
    ctx: &HookContext,
    fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    kind: EventKind,
) {
    ctx.table.with_slot(fd, |conn| {
        let Some(conn) = conn else { return };
        conn.append(return_value, success, error, kind);
        maybe_flush(conn);
    });
    maybe_tcp_info(ctx, fd);
}

/// Like [`simple_event`], but for a connection not yet inserted into the
/// descriptor table — used only by `socket_post`, where the fresh record
/// must record its own creation event before `ctx.table.put` makes it
/// reachable under the slot lock.
fn append_and_maybe_flush(
    _ctx: &HookContext,
    conn: &mut Connection,
    _fd: RawFd,
    return_value: i64,
    success: bool,
    error: Option<String>,
    kind: EventKind,
) {
    conn.append(return_value, success, error, kind);
    maybe_flush(conn);
}

fn maybe_flush(conn: &mut Connection) {
    if conn.should_flush() {
        if let Err(err) = conn.flush(false) {
            tracing::warn!(fd = conn.id, error = %err, "failed to flush connection's event log");
        }
    }
}

/// Periodic `tcp_info` trigger. Runs outside the slot lock that the
/// triggering event held, since querying the kernel's own notion of the
/// connection is a distinct operation from the append it follows. Never
/// recurses: the event it appends is itself a `tcp_info` event, which is
/// never a trigger for another one.
fn maybe_tcp_info(ctx: &HookContext, fd: RawFd) {
    let gate_passed = ctx.table.with_slot(fd, |conn| {
        let Some(conn) = conn else { return false };
        let now = Timestamp::now().as_micros();
        conn.tcp_info_gate(now, ctx.config.dump_every_bytes(), ctx.config.dump_every_micros())
    });
    if !gate_passed {
        return;
    }
    let (success, error, snapshot) = match ctx.raw.tcp_info(fd) {
        Some(snapshot) => (true, None, snapshot),
        None => (
            false,
            Some("getsockopt(IPPROTO_TCP, TCP_INFO) failed".to_string()),
            TcpInfoSnapshot::default(),
        ),
    };
    ctx.table.with_slot(fd, |conn| {
        let Some(conn) = conn else { return };
        conn.append(
            0,
            success,
            error,
            EventKind::TcpInfo(TcpInfoEvent { info: snapshot }),
        );
        maybe_flush(conn);
    });
}

/// Capture-session startup on the first event that establishes a peer
/// address. Runs entirely outside any slot lock: force-binding calls back
/// into `bind`, which re-acquires this descriptor's own slot lock.
fn maybe_start_capture(ctx: &HookContext, fd: RawFd, peer: &AddressInfo) {
    let already_capturing = ctx
        .table
        .with_slot(fd, |conn| conn.as_ref().map(|c| c.capture.is_some()).unwrap_or(true));
    if already_capturing {
        return;
    }

    let is_bound = ctx
        .table
        .with_slot(fd, |conn| conn.as_ref().map(|c| c.bound).unwrap_or(false));

    let local_port = if is_bound {
        ctx.table
            .with_slot(fd, |conn| conn.as_ref().and_then(|c| c.bound_addr.as_ref()).map(|a| a.port))
    } else {
        let bound_addr = capture::force_bind(fd, |fd, addr| ctx.raw.bind(fd, addr));
        match bound_addr {
            Some(addr) => {
                let info = address::address_info_from_std(addr);
                bind_post(ctx, fd, 0, true, None, &info, true);
                Some(info.port)
            }
            None => None,
        }
    };

    let directory = ctx
        .table
        .with_slot(fd, |conn| conn.as_ref().map(|c| c.directory.clone()));
    let Some(directory) = directory else { return };

    match capture::start(&directory, peer, local_port, None) {
        Ok(handle) => {
            ctx.table.with_slot(fd, |conn| {
                if let Some(conn) = conn {
                    conn.capture = Some(handle);
                }
            });
        }
        Err(err) => {
            tracing::warn!(fd, error = %err, "failed to start packet capture");
        }
    }
}
