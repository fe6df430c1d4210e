// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! A small layer-based logging bridge, modeled on the reload-capable
//! `tracing_subscriber` logger used elsewhere in this codebase: a global
//! subscriber holding two independently reconfigurable sinks (file, stderr),
//! each with its own verbosity, so that the library's own diagnostics never
//! depend on whatever subscriber (if any) the host process has installed.

use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::{self, Handle};
use tracing_subscriber::{fmt, Layer, Registry};

/// The spec's 0..5 integer verbosity, mapped onto `tracing`'s levels.
/// `0` disables the sink entirely.
fn level_filter(level: u8) -> LevelFilter {
    match level.min(5) {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[allow(clippy::type_complexity)]
struct Logger {
    layer_handle: Handle<Vec<BoxedLayer>, Registry>,
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Logger {
    fn install() -> Logger {
        let (layers_layer, layer_handle) = reload::Layer::new(Vec::<BoxedLayer>::new());
        let subscriber = tracing_subscriber::registry().with(layers_layer);
        // Calling this more than once across the process lifetime (e.g. after
        // a fork-time reset re-initializes into a fresh child) would return
        // an error from the second call onward; that's fine, the first
        // process-wide install is the one that sticks and our per-logger
        // `layer_handle` still lets us swap sinks afterward.
        let _ = tracing::subscriber::set_global_default(subscriber);
        Logger {
            layer_handle,
            _file_guard: None,
        }
    }

    fn configure(&mut self, log_dir: &Path, level_file: u8, level_stderr: u8) -> anyhow::Result<()> {
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut file_guard = None;

        if level_file > 0 {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::never(log_dir, "main.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            file_guard = Some(guard);
            layers.push(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(level_filter(level_file))
                    .boxed(),
            );
        }

        if level_stderr > 0 {
            layers.push(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(level_filter(level_stderr))
                    .boxed(),
            );
        }

        self.layer_handle
            .modify(|current| *current = layers)
            .map_err(|e| anyhow::anyhow!("failed to reconfigure logger: {e}"))?;
        self._file_guard = file_guard;
        Ok(())
    }
}

static LOGGER: LazyLock<Mutex<Logger>> = LazyLock::new(|| Mutex::new(Logger::install()));

/// Directs library logs to `<log_dir>/main.log` at `level_file` and to
/// stderr at `level_stderr`. Safe to call more than once (e.g. after a
/// post-fork reset): each call fully replaces the previous sink set.
///
/// Failures (e.g. `log_dir` not creatable) are swallowed: logging is a
/// best-effort ambient concern and must never be fatal to the host.
pub fn init(log_dir: &Path, level_file: u8, level_stderr: u8) {
    let mut logger = match LOGGER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(e) = logger.configure(log_dir, level_file, level_stderr) {
        eprintln!("tcpsnitch: failed to configure logging: {e:#}");
    }
}

/// Tears down the file sink, keeping stderr (if enabled), the way a
/// post-fork reset should before `init` is called again with a fresh
/// per-pid log directory.
pub fn reset() {
    let mut logger = match LOGGER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let _ = logger
        .layer_handle
        .modify(|current| current.clear());
    logger._file_guard = None;
}

pub fn resolve_log_dir(base: &Path, pid: u32) -> PathBuf {
    base.join(pid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_both_sinks_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), 3, 2);
        tracing::info!(target: "tcpsnitch", "hello");
        reset();
    }

    #[test]
    fn zero_level_disables_file_sink_without_creating_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist-yet");
        init(&missing, 0, 0);
        assert!(!missing.exists());
        reset();
    }

    #[test]
    fn resolve_log_dir_joins_pid() {
        let base = Path::new("/tmp/tcpsnitch");
        assert_eq!(resolve_log_dir(base, 42), Path::new("/tmp/tcpsnitch/42"));
    }
}
