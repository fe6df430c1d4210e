// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-once configuration snapshot, sourced from environment variables.
//!
//! Unknown or missing variables take defaults; non-integer values where
//! integers are expected are treated as the default rather than rejected —
//! a misconfigured deployment should degrade, not crash the host process.

use std::path::PathBuf;

/// Low-level env-var parsing helpers, one per expected shape.
///
/// Mirrors the style of `ddcommon::config::parse_env`: each helper returns
/// `None` on any failure (missing var, unparsable value) and callers supply
/// the default.
pub mod parse_env {
    use std::env;
    use std::str::FromStr;

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        let var = env::var(name).ok()?;
        Some(var == "true" || var == "1")
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

const ENV_DUMP_EVERY_BYTES: &str = "TCPSNITCH_DUMP_EVERY_BYTES";
const ENV_DUMP_EVERY_MICROS: &str = "TCPSNITCH_DUMP_EVERY_MICROS";
const ENV_DUMP_EVERY_EVENTS: &str = "TCPSNITCH_DUMP_EVERY_EVENTS";
const ENV_CAPTURE_ENABLED: &str = "TCPSNITCH_CAPTURE_ENABLED";
const ENV_LOG_DIR: &str = "TCPSNITCH_LOG_DIR";
const ENV_LOG_LEVEL_FILE: &str = "TCPSNITCH_LOG_LEVEL_FILE";
const ENV_LOG_LEVEL_STDERR: &str = "TCPSNITCH_LOG_LEVEL_STDERR";

const DEFAULT_DUMP_EVERY_BYTES: u64 = 0;
const DEFAULT_DUMP_EVERY_MICROS: u64 = 0;
const DEFAULT_DUMP_EVERY_EVENTS: u32 = 20;
const DEFAULT_CAPTURE_ENABLED: bool = false;
const DEFAULT_LOG_DIR: &str = "/tmp/tcpsnitch";
const DEFAULT_LOG_LEVEL: u8 = 2;

/// Immutable configuration snapshot, read once at library init.
///
/// Field semantics match the distilled specification exactly: `dump_every_bytes`
/// and `dump_every_micros` of zero disable their respective trigger, while
/// `dump_every_events` of zero would disable flushing entirely, which is why
/// it is coerced up to 1 in [`Config::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    dump_every_bytes: u64,
    dump_every_micros: u64,
    dump_every_events: u32,
    capture_enabled: bool,
    log_dir: PathBuf,
    log_level_file: u8,
    log_level_stderr: u8,
}

impl Config {
    /// Snapshots the current environment into a `Config`. Never fails: any
    /// missing or malformed variable silently falls back to its default, the
    /// same degrade-rather-than-crash policy `parse_env` embodies.
    pub fn from_env() -> Self {
        let dump_every_events =
            parse_env::int::<u32>(ENV_DUMP_EVERY_EVENTS).unwrap_or(DEFAULT_DUMP_EVERY_EVENTS);
        Config {
            dump_every_bytes: parse_env::int(ENV_DUMP_EVERY_BYTES)
                .unwrap_or(DEFAULT_DUMP_EVERY_BYTES),
            dump_every_micros: parse_env::int(ENV_DUMP_EVERY_MICROS)
                .unwrap_or(DEFAULT_DUMP_EVERY_MICROS),
            // A threshold of 0 would mean "flush after every 0 events", an
            // infinite loop; floor it to 1, matching "dump_every_events > 0".
            dump_every_events: dump_every_events.max(1),
            capture_enabled: parse_env::bool(ENV_CAPTURE_ENABLED)
                .unwrap_or(DEFAULT_CAPTURE_ENABLED),
            log_dir: parse_env::str_not_empty(ENV_LOG_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            log_level_file: parse_env::int(ENV_LOG_LEVEL_FILE).unwrap_or(DEFAULT_LOG_LEVEL),
            log_level_stderr: parse_env::int(ENV_LOG_LEVEL_STDERR).unwrap_or(DEFAULT_LOG_LEVEL),
        }
    }

    /// Builder override, mainly useful for tests that need a specific gate
    /// threshold without going through the environment.
    pub fn with_dump_every_bytes(mut self, bytes: u64) -> Self {
        self.dump_every_bytes = bytes;
        self
    }

    pub fn dump_every_bytes(&self) -> u64 {
        self.dump_every_bytes
    }

    pub fn dump_every_micros(&self) -> u64 {
        self.dump_every_micros
    }

    pub fn dump_every_events(&self) -> u32 {
        self.dump_every_events
    }

    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled
    }

    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }

    pub fn log_level_file(&self) -> u8 {
        self.log_level_file.min(5)
    }

    pub fn log_level_stderr(&self) -> u8 {
        self.log_level_stderr.min(5)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dump_every_bytes: DEFAULT_DUMP_EVERY_BYTES,
            dump_every_micros: DEFAULT_DUMP_EVERY_MICROS,
            dump_every_events: DEFAULT_DUMP_EVERY_EVENTS,
            capture_enabled: DEFAULT_CAPTURE_ENABLED,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            log_level_file: DEFAULT_LOG_LEVEL,
            log_level_stderr: DEFAULT_LOG_LEVEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            ENV_DUMP_EVERY_BYTES,
            ENV_DUMP_EVERY_MICROS,
            ENV_DUMP_EVERY_EVENTS,
            ENV_CAPTURE_ENABLED,
            ENV_LOG_DIR,
            ENV_LOG_LEVEL_FILE,
            ENV_LOG_LEVEL_STDERR,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults_when_env_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = Config::from_env();
        assert_eq!(config.dump_every_bytes(), 0);
        assert_eq!(config.dump_every_micros(), 0);
        assert_eq!(config.dump_every_events(), DEFAULT_DUMP_EVERY_EVENTS);
        assert!(!config.capture_enabled());
        assert_eq!(config.log_dir(), std::path::Path::new(DEFAULT_LOG_DIR));
    }

    #[test]
    fn non_integer_value_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(ENV_DUMP_EVERY_BYTES, "not-a-number");
        let config = Config::from_env();
        assert_eq!(config.dump_every_bytes(), DEFAULT_DUMP_EVERY_BYTES);
        clear_env();
    }

    #[test]
    fn dump_every_events_zero_is_floored_to_one() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(ENV_DUMP_EVERY_EVENTS, "0");
        let config = Config::from_env();
        assert_eq!(config.dump_every_events(), 1);
        clear_env();
    }

    #[test]
    fn capture_enabled_accepts_1_and_true() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(ENV_CAPTURE_ENABLED, "1");
        assert!(Config::from_env().capture_enabled());
        std::env::set_var(ENV_CAPTURE_ENABLED, "true");
        assert!(Config::from_env().capture_enabled());
        std::env::set_var(ENV_CAPTURE_ENABLED, "false");
        assert!(!Config::from_env().capture_enabled());
        clear_env();
    }
}
