// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-connection packet-capture coordinator: force-bind, BPF filter
//! construction, and the capture worker thread itself.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pcap::{Capture, Device};
use tcpsnitch_common::address::AddressInfo;

/// The port range the library scans when the host has not bound the socket
/// itself but capture needs a local port to filter on.
pub const FORCE_BIND_RANGE: RangeInclusive<u16> = 32768..=60999;

#[derive(Debug, thiserror::Error)]
pub enum CaptureSetupError {
    #[error("no capture device available")]
    NoDevice,
    #[error("capture device {0:?} not found")]
    DeviceNotFound(String),
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),
}

/// Attempts to bind `fd` to each port in [`FORCE_BIND_RANGE`] in turn via
/// `bind_attempt`, retrying on `EADDRINUSE` and giving up on any other
/// failure. Returns the address that succeeded, or `None` if the whole
/// range is exhausted.
///
/// `bind_attempt` is injected rather than calling `bind(2)` directly so this
/// function stays a pure, unit-testable port scanner; in production it is
/// supplied by the interposer and itself triggers the wrapped `bind` entry
/// point, which is how a `force_bind=true` event ends up in the connection's
/// log (see `hooks::connect_post`).
pub fn force_bind(
    fd: RawFd,
    mut bind_attempt: impl FnMut(RawFd, SocketAddr) -> nix::Result<()>,
) -> Option<SocketAddr> {
    for port in FORCE_BIND_RANGE {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        match bind_attempt(fd, addr) {
            Ok(()) => return Some(addr),
            Err(nix::errno::Errno::EADDRINUSE) => continue,
            Err(_) => return None,
        }
    }
    None
}

/// Builds the BPF expression the coordinator installs: always pinned to the
/// peer host and port, plus the local port when the socket is bound.
pub fn build_filter(peer: &AddressInfo, local_port: Option<u16>) -> String {
    let mut filter = format!("host {} and port {}", peer.ip, peer.port);
    if let Some(port) = local_port {
        filter.push_str(&format!(" and port {port}"));
    }
    filter
}

fn resolve_device(name: Option<&str>) -> Result<Device, CaptureSetupError> {
    match name {
        Some(name) => Device::list()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| CaptureSetupError::DeviceNotFound(name.to_string())),
        None => Device::lookup()?.ok_or(CaptureSetupError::NoDevice),
    }
}

/// A running per-connection capture session.
pub struct CaptureHandle {
    filter: String,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Stops the capture worker, delaying by `2 * rtt` to allow TCP teardown
    /// packets to be captured before the filter is torn down, then joins the
    /// worker thread. Safe to call from any thread; blocks the caller for
    /// the delay plus however long the worker takes to notice the flag.
    pub fn stop(mut self, rtt: Duration) {
        std::thread::sleep(rtt.saturating_mul(2));
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Opens a capture handle on `device` (or the default device), installs a
/// filter scoped to `peer`/`local_port`, and spawns a worker thread writing
/// matching frames to `<directory>/capture.pcap`.
pub fn start(
    directory: &Path,
    peer: &AddressInfo,
    local_port: Option<u16>,
    device: Option<&str>,
) -> Result<CaptureHandle, CaptureSetupError> {
    let device = resolve_device(device)?;
    let filter = build_filter(peer, local_port);

    let inactive = Capture::from_device(device)?;
    let mut active = inactive.promisc(false).timeout(200).open()?;
    active.filter(&filter, true)?;
    let mut savefile = active.savefile(directory.join("capture.pcap"))?;

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let worker = std::thread::spawn(move || loop {
        if worker_stop.load(Ordering::SeqCst) {
            break;
        }
        match active.next_packet() {
            Ok(packet) => savefile.write(&packet),
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(_) => break,
        }
    });

    Ok(CaptureHandle {
        filter,
        stop,
        worker: Some(worker),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_local_port_when_bound() {
        let peer = AddressInfo {
            family: libc::AF_INET,
            ip: "10.0.0.1".to_string(),
            port: 443,
        };
        assert_eq!(
            build_filter(&peer, Some(40000)),
            "host 10.0.0.1 and port 443 and port 40000"
        );
    }

    #[test]
    fn filter_omits_local_port_when_unbound() {
        let peer = AddressInfo {
            family: libc::AF_INET,
            ip: "10.0.0.1".to_string(),
            port: 443,
        };
        assert_eq!(build_filter(&peer, None), "host 10.0.0.1 and port 443");
    }

    #[test]
    fn force_bind_retries_eaddrinuse_then_succeeds() {
        let mut attempts = 0;
        let result = force_bind(3, |_fd, addr| {
            attempts += 1;
            if addr.port() < FORCE_BIND_RANGE.start() + 2 {
                Err(nix::errno::Errno::EADDRINUSE)
            } else {
                Ok(())
            }
        });
        assert!(result.is_some());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn force_bind_exhausts_range_and_gives_up() {
        let result = force_bind(3, |_fd, _addr| Err(nix::errno::Errno::EADDRINUSE));
        assert!(result.is_none());
    }

    #[test]
    fn force_bind_stops_on_unexpected_error() {
        let mut attempts = 0;
        let result = force_bind(3, |_fd, _addr| {
            attempts += 1;
            Err(nix::errno::Errno::EPERM)
        });
        assert!(result.is_none());
        assert_eq!(attempts, 1);
    }
}
