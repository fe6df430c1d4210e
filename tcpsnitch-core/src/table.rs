// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! The descriptor table: a self-resizing vector of per-slot locks guarded by
//! a coarse resize lock, mapping a file descriptor to its [`Connection`].
//!
//! A plain `RwLock<Vec<Mutex<Option<Connection>>>>` rather than a concurrent
//! map: descriptors are small dense integers, so a vector indexed by `fd` is
//! both the simplest and the fastest representation, and the resize lock is
//! only ever taken for the rare case of a descriptor past the current
//! capacity.

use std::sync::{Mutex, MutexGuard, RwLock};

use crate::connection::Connection;

const INITIAL_CAPACITY: usize = 256;

pub struct DescriptorTable {
    slots: RwLock<Vec<Mutex<Option<Connection>>>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            slots: RwLock::new(Self::fresh_slots(INITIAL_CAPACITY)),
        }
    }

    fn fresh_slots(capacity: usize) -> Vec<Mutex<Option<Connection>>> {
        let mut v = Vec::with_capacity(capacity);
        v.resize_with(capacity, || Mutex::new(None));
        v
    }

    fn ensure_capacity(&self, fd: usize) {
        let needs_resize = {
            let slots = self.slots.read().expect("descriptor table poisoned");
            fd >= slots.len()
        };
        if !needs_resize {
            return;
        }
        let mut slots = self.slots.write().expect("descriptor table poisoned");
        if fd >= slots.len() {
            let mut new_len = slots.len().max(1);
            while fd >= new_len {
                new_len *= 2;
            }
            slots.resize_with(new_len, || Mutex::new(None));
        }
    }

    /// Installs `connection` at `fd`, replacing (and dropping) whatever was
    /// there before. Used both for brand-new descriptors and for the stale
    /// descriptor reuse case, where the kernel recycles an fd number before
    /// we have been told to drop the old connection.
    pub fn put(&self, fd: i32, connection: Connection) {
        self.ensure_capacity(fd as usize);
        let slots = self.slots.read().expect("descriptor table poisoned");
        *slots[fd as usize].lock().expect("slot poisoned") = Some(connection);
    }

    pub fn is_present(&self, fd: i32) -> bool {
        if fd < 0 {
            return false;
        }
        let slots = self.slots.read().expect("descriptor table poisoned");
        match slots.get(fd as usize) {
            Some(slot) => slot.lock().expect("slot poisoned").is_some(),
            None => false,
        }
    }

    /// Removes and returns the connection at `fd`, if any. Used when a
    /// `close` event finalizes a connection's timeline.
    pub fn remove(&self, fd: i32) -> Option<Connection> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read().expect("descriptor table poisoned");
        slots
            .get(fd as usize)
            .and_then(|slot| slot.lock().expect("slot poisoned").take())
    }

    /// Acquires the slot for `fd`, runs `f` against it, and releases the
    /// lock before returning. `f` receives `None` when no connection is
    /// tracked at `fd` (an untracked or non-socket descriptor).
    ///
    /// Callers must not call back into the table from within `f`: the slot
    /// lock is held for the duration of the closure, and the resize lock is
    /// held read-side, so a reentrant call for a *different* fd is safe but
    /// one for the *same* fd deadlocks.
    pub fn with_slot<R>(&self, fd: i32, f: impl FnOnce(Option<&mut Connection>) -> R) -> R {
        self.ensure_capacity(fd.max(0) as usize);
        let slots = self.slots.read().expect("descriptor table poisoned");
        let mut guard: MutexGuard<Option<Connection>> =
            slots[fd as usize].lock().expect("slot poisoned");
        f(guard.as_mut())
    }

    /// Number of slots currently allocated (not the number of live
    /// connections). Exposed for tests and diagnostics.
    pub fn capacity(&self) -> usize {
        self.slots.read().expect("descriptor table poisoned").len()
    }

    /// Drops every tracked connection, returning their descriptor numbers in
    /// ascending order. Used by the atexit sweep, which synthesizes a
    /// `close` event for each before flushing and dropping it, and by the
    /// post-fork reset, which discards all state without synthesizing
    /// anything.
    pub fn drain(&self) -> Vec<(i32, Connection)> {
        let mut slots = self.slots.write().expect("descriptor table poisoned");
        let mut drained = Vec::new();
        for (fd, slot) in slots.iter_mut().enumerate() {
            if let Some(connection) = slot.get_mut().expect("slot poisoned").take() {
                drained.push((fd as i32, connection));
            }
        }
        drained
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn connection(id: u64) -> Connection {
        Connection::new(id, PathBuf::from("/tmp"), 20)
    }

    #[test]
    fn put_then_is_present() {
        let table = DescriptorTable::new();
        assert!(!table.is_present(5));
        table.put(5, connection(5));
        assert!(table.is_present(5));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let table = DescriptorTable::new();
        let big_fd = INITIAL_CAPACITY as i32 + 10;
        table.put(big_fd, connection(1));
        assert!(table.is_present(big_fd));
        assert!(table.capacity() > INITIAL_CAPACITY);
    }

    #[test]
    fn remove_clears_the_slot() {
        let table = DescriptorTable::new();
        table.put(3, connection(1));
        let removed = table.remove(3);
        assert!(removed.is_some());
        assert!(!table.is_present(3));
    }

    #[test]
    fn with_slot_mutates_in_place() {
        let table = DescriptorTable::new();
        table.put(7, connection(1));
        table.with_slot(7, |conn| {
            conn.unwrap().bytes_sent = 42;
        });
        table.with_slot(7, |conn| {
            assert_eq!(conn.unwrap().bytes_sent, 42);
        });
    }

    #[test]
    fn with_slot_on_untracked_fd_gets_none() {
        let table = DescriptorTable::new();
        table.with_slot(99, |conn| assert!(conn.is_none()));
    }

    #[test]
    fn drain_empties_the_table_and_reports_all_fds() {
        let table = DescriptorTable::new();
        table.put(1, connection(1));
        table.put(2, connection(2));
        let mut drained = table.drain();
        drained.sort_by_key(|(fd, _)| *fd);
        let fds: Vec<i32> = drained.iter().map(|(fd, _)| *fd).collect();
        assert_eq!(fds, vec![1, 2]);
        assert!(!table.is_present(1));
        assert!(!table.is_present(2));
    }

    #[test]
    fn put_reuses_stale_slot_without_panicking() {
        let table = DescriptorTable::new();
        table.put(4, connection(1));
        table.put(4, connection(2));
        table.with_slot(4, |conn| assert_eq!(conn.unwrap().id, 2));
    }
}
