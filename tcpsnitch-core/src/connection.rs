// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-connection state: identity, counters, the event timeline, and dump
//! bookmarks, as described in the data model.

use std::path::PathBuf;
use std::time::Duration;

use tcpsnitch_common::address::AddressInfo;

use crate::capture::CaptureHandle;
use crate::event::{Event, EventKind};
use crate::sink::{FlushError, JsonSink};

/// One live socket descriptor's worth of state.
pub struct Connection {
    pub id: u64,
    pub directory: PathBuf,
    events: Vec<Event>,
    events_count: u64,
    last_flushed_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    last_info_dump_bytes: u64,
    last_info_dump_micros: u64,
    pub bound: bool,
    pub bound_addr: Option<AddressInfo>,
    pub force_bind: bool,
    pub capture: Option<CaptureHandle>,
    pub rtt: Duration,
    sink: JsonSink,
    dump_every_events: u32,
}

impl Connection {
    pub fn new(id: u64, directory: PathBuf, dump_every_events: u32) -> Self {
        let sink = JsonSink::new(&directory);
        Connection {
            id,
            directory,
            events: Vec::new(),
            events_count: 0,
            last_flushed_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_info_dump_bytes: 0,
            last_info_dump_micros: 0,
            bound: false,
            bound_addr: None,
            force_bind: false,
            capture: None,
            rtt: Duration::ZERO,
            sink,
            dump_every_events: dump_every_events.max(1),
        }
    }

    pub fn events_count(&self) -> u64 {
        self.events_count
    }

    pub fn last_flushed_count(&self) -> u64 {
        self.last_flushed_count
    }

    /// Currently buffered, not-yet-flushed events. Exposed for tests and for
    /// the final atexit sweep's bookkeeping.
    pub fn pending_events(&self) -> &[Event] {
        &self.events
    }

    /// Builds and appends a new event, updating the cumulative byte counters
    /// and `tcp_info` bookmarks this event type affects. Returns a reference
    /// to the freshly appended event (the caller may need its id or kind to
    /// decide on downstream work, e.g. triggering capture setup).
    pub fn append(
        &mut self,
        return_value: i64,
        success: bool,
        error_str: Option<String>,
        kind: EventKind,
    ) -> &Event {
        let id = self.events_count;
        if let Some(bytes) = kind.transfer_bytes() {
            if kind.is_outbound() {
                self.bytes_sent += bytes;
            } else {
                self.bytes_received += bytes;
            }
        }
        if let EventKind::TcpInfo(ref info) = kind {
            self.rtt = Duration::from_micros(info.info.rtt_usec as u64);
            self.last_info_dump_bytes = self.bytes_sent + self.bytes_received;
            self.last_info_dump_micros = crate::event::Timestamp::now().as_micros();
        }
        let event = Event::new(id, return_value, success, error_str, kind);
        self.events.push(event);
        self.events_count += 1;
        self.events.last().expect("just pushed")
    }

    /// Whether a non-final flush should happen now, per
    /// `events_count - last_flushed_count >= dump_every_events`.
    pub fn should_flush(&self) -> bool {
        self.events_count - self.last_flushed_count >= self.dump_every_events as u64
    }

    /// Whether both the periodic `tcp_info` gates (time, bytes) currently
    /// pass. Both must pass (conjunction); a threshold of zero disables its
    /// respective gate.
    pub fn tcp_info_gate(
        &self,
        now_micros: u64,
        dump_every_bytes: u64,
        dump_every_micros: u64,
    ) -> bool {
        let time_ok = dump_every_micros == 0
            || now_micros.saturating_sub(self.last_info_dump_micros) >= dump_every_micros;
        let bytes_ok = dump_every_bytes == 0
            || (self.bytes_sent + self.bytes_received).saturating_sub(self.last_info_dump_bytes)
                >= dump_every_bytes;
        time_ok && bytes_ok
    }

    /// Flushes pending events to disk. On success, frees the in-memory
    /// queue (unless this is the final flush, in which case the connection
    /// is about to be dropped anyway) and advances `last_flushed_count`. On
    /// failure, the queue is retained untouched so the next flush attempt
    /// resends everything.
    pub fn flush(&mut self, final_flush: bool) -> Result<(), FlushError> {
        self.sink.append(&self.events, final_flush)?;
        self.last_flushed_count = self.events_count;
        self.events.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CloseEvent, DataEvent, ListenEvent, MessageEvent};
    use tcpsnitch_common::flags::MessageFlags;

    fn conn() -> Connection {
        let dir = tempfile::tempdir().unwrap();
        Connection::new(0, dir.path().to_path_buf(), 20)
    }

    #[test]
    fn ids_are_dense_and_monotone() {
        let mut c = conn();
        c.append(0, true, None, EventKind::Listen(ListenEvent { backlog: 1 }));
        c.append(
            100,
            true,
            None,
            EventKind::Write(DataEvent { bytes: 10 }),
        );
        assert_eq!(c.pending_events()[0].id, 0);
        assert_eq!(c.pending_events()[1].id, 1);
        assert_eq!(c.events_count(), 2);
    }

    #[test]
    fn send_and_recv_update_distinct_byte_counters() {
        let mut c = conn();
        c.append(
            100,
            true,
            None,
            EventKind::Send(MessageEvent {
                bytes: 100,
                flags: MessageFlags::default(),
            }),
        );
        c.append(
            40,
            true,
            None,
            EventKind::Recv(MessageEvent {
                bytes: 40,
                flags: MessageFlags::default(),
            }),
        );
        assert_eq!(c.bytes_sent, 100);
        assert_eq!(c.bytes_received, 40);
    }

    #[test]
    fn should_flush_once_threshold_reached() {
        let mut c = conn();
        for _ in 0..19 {
            c.append(0, true, None, EventKind::Listen(ListenEvent { backlog: 1 }));
        }
        assert!(!c.should_flush());
        c.append(0, true, None, EventKind::Listen(ListenEvent { backlog: 1 }));
        assert!(c.should_flush());
    }

    #[test]
    fn flush_clears_queue_and_advances_bookmark() {
        let mut c = conn();
        c.append(0, true, None, EventKind::Listen(ListenEvent { backlog: 1 }));
        c.flush(false).unwrap();
        assert_eq!(c.last_flushed_count(), 1);
        assert!(c.pending_events().is_empty());
    }

    #[test]
    fn zero_thresholds_disable_their_gate() {
        let c = conn();
        assert!(c.tcp_info_gate(1_000_000, 0, 0));
    }

    #[test]
    fn nonzero_byte_gate_blocks_until_delta_reached() {
        let mut c = conn();
        c.append(
            500,
            true,
            None,
            EventKind::Send(MessageEvent {
                bytes: 500,
                flags: MessageFlags::default(),
            }),
        );
        assert!(!c.tcp_info_gate(c.last_info_dump_micros, 1024, 0));
        c.append(
            600,
            true,
            None,
            EventKind::Send(MessageEvent {
                bytes: 600,
                flags: MessageFlags::default(),
            }),
        );
        assert!(c.tcp_info_gate(c.last_info_dump_micros, 1024, 0));
    }

    #[test]
    fn final_flush_terminates_array_even_with_no_more_events() {
        let mut c = conn();
        c.append(0, true, None, EventKind::Listen(ListenEvent { backlog: 1 }));
        c.flush(false).unwrap();
        c.append(
            0,
            true,
            None,
            EventKind::Close(CloseEvent { detected: true }),
        );
        c.flush(true).unwrap();
        let contents = std::fs::read_to_string(c.directory.join("events.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }
}
