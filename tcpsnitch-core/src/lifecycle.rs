// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide initialization, atexit cleanup, and post-fork reset.
//!
//! Mirrors the idempotent-init / signal-safe-reset shape used for crash
//! reporter setup: a single error-checking mutex guards a one-shot init,
//! and a separate reset path tears everything down without relying on the
//! init path's locks still being sane (a `fork` in the child may land
//! mid-critical-section in the parent's copy of any lock).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tcpsnitch_common::Config;

use crate::hooks::{HookContext, RawOps};
use crate::table::DescriptorTable;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Guards the init/reset critical sections. An error-checking mutex in the
/// original design; `std::sync::Mutex` here plays the same role since Rust
/// mutexes already detect same-thread re-lock via `TryLockError`, and init
/// is never expected to be called reentrantly on the same thread.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Everything the hooks need for the lifetime of one process incarnation
/// (reset on fork, torn down at process exit).
pub struct Runtime {
    pub table: DescriptorTable,
    pub config: Config,
    pub directory: PathBuf,
}

impl Runtime {
    fn new(config: Config, directory: PathBuf) -> Self {
        Runtime {
            table: DescriptorTable::new(),
            config,
            directory,
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst)
    }

    pub fn hook_context<'a>(&'a self, raw: &'a dyn RawOps) -> HookContext<'a> {
        HookContext {
            table: &self.table,
            config: &self.config,
            directory: &self.directory,
            raw,
        }
    }
}

/// Finds the first non-existent `<base>/<n>` directory for `n = 0, 1, ...`
/// and creates it, world-writable so a privilege-dropped child of the host
/// process can still write into it.
pub fn allocate_output_directory(base: &Path) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let mut n: u64 = 0;
    loop {
        let candidate = base.join(n.to_string());
        match std::fs::create_dir_all(&candidate) {
            Ok(()) => {
                let _ = std::fs::set_permissions(&candidate, std::fs::Permissions::from_mode(0o777));
                return Ok(candidate);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                n += 1;
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs library initialization exactly once per process incarnation (reset
/// by [`reset`] after a `fork`). Returns the runtime to install globally.
/// Degrades rather than fails: if the output directory cannot be created,
/// falls back to a process-local temporary directory so events are still
/// recorded in memory and, where possible, on disk.
pub fn init() -> Runtime {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    let config = Config::from_env();

    let directory = allocate_output_directory(config.log_dir())
        .unwrap_or_else(|_| std::env::temp_dir().join("tcpsnitch-fallback"));

    tcpsnitch_log::init(&directory, config.log_level_file(), config.log_level_stderr());

    INITIALIZED.store(true, Ordering::SeqCst);
    Runtime::new(config, directory)
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Atexit sweep: synthesizes a `close(detected=true)` event for every
/// connection still present in the table, which finalizes its flush and
/// closes its JSON array. Connections are handled in ascending fd order,
/// matching a scan from 0 to the table's size.
pub fn cleanup(runtime: &Runtime) {
    let mut drained = runtime.table.drain();
    drained.sort_by_key(|(fd, _)| *fd);
    for (fd, mut connection) in drained {
        connection.append(
            0,
            true,
            None,
            crate::event::EventKind::Close(crate::event::CloseEvent { detected: true }),
        );
        if let Some(capture) = connection.capture.take() {
            capture.stop(connection.rtt);
        }
        if let Err(err) = connection.flush(true) {
            tracing::warn!(fd, error = %err, "failed to finalize connection during cleanup");
        }
    }
}

/// Post-fork reset, run in the child immediately after `fork` returns 0.
/// Drops the descriptor table and all its records without synthesizing any
/// events (the child has no ownership claim over the parent's in-flight
/// connections), resets the connection-id counter, resets logging, and
/// marks the process uninitialized so the next wrapped call re-runs
/// [`init`] into a fresh per-pid output directory.
pub fn reset() -> Runtime {
    NEXT_CONNECTION_ID.store(0, Ordering::SeqCst);
    tcpsnitch_log::reset();
    INITIALIZED.store(false, Ordering::SeqCst);
    init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_output_directory_picks_first_free_integer() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("0")).unwrap();
        let dir = allocate_output_directory(base.path()).unwrap();
        assert_eq!(dir, base.path().join("1"));
    }

    #[test]
    fn allocate_output_directory_starts_at_zero_when_empty() {
        let base = tempfile::tempdir().unwrap();
        let dir = allocate_output_directory(base.path()).unwrap();
        assert_eq!(dir, base.path().join("0"));
    }

    #[test]
    fn cleanup_synthesizes_close_for_still_open_connection() {
        use crate::connection::Connection;

        let base = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(Config::default(), base.path().to_path_buf());
        let conn_dir = base.path().join("0");
        std::fs::create_dir_all(&conn_dir).unwrap();
        let mut connection = Connection::new(0, conn_dir.clone(), 20);
        connection.append(
            0,
            true,
            None,
            crate::event::EventKind::Listen(crate::event::ListenEvent { backlog: 1 }),
        );
        runtime.table.put(3, connection);

        cleanup(&runtime);

        assert!(!runtime.table.is_present(3));
        let contents = std::fs::read_to_string(conn_dir.join("events.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        let events = parsed.as_array().unwrap();
        let close = events.last().unwrap();
        assert_eq!(close["type"], "close");
        assert_eq!(close["detected"], true);
        assert_eq!(close["return_value"], 0);
    }
}
