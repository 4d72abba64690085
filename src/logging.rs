// this_file: src/logging.rs

//! Logging setup and backend write timing.
//!
//! The session core logs through the `log` facade; the embedding server
//! decides where that output goes. [`init_logging`] covers the common
//! case: `RUST_LOG`-driven env_logger output, safe to call from several
//! places without fighting over who initializes first. [`WriteTimer`]
//! times individual backend writes for the write scheduler.

use env_logger::{Builder, Env};
use log::{debug, warn};
use std::fmt;
use std::time::Instant;

/// Backend writes slower than this are logged at warn level.
const SLOW_WRITE_MS: f64 = 500.0;

/// Initialize process-wide logging from `RUST_LOG`, defaulting this
/// crate's targets to `info`.
///
/// Later calls are no-ops, so servers and test harnesses can call it
/// unconditionally.
pub fn init_logging() {
    let env = Env::default().default_filter_or("fonthub=info");
    let _ = Builder::from_env(env).format_timestamp(None).try_init();
}

/// Logs the duration of one backend write when dropped.
///
/// Slow writes surface at warn level, so a struggling backend is visible
/// before it starts failing outright.
pub struct WriteTimer {
    target: String,
    start: Instant,
}

impl WriteTimer {
    /// Start timing the write of `key`.
    pub fn start(key: impl fmt::Display) -> Self {
        WriteTimer {
            target: key.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for WriteTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms >= SLOW_WRITE_MS {
            warn!("slow backend write {}: {:.1}ms", self.target, elapsed_ms);
        } else {
            debug!("write {} took {:.1}ms", self.target, elapsed_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_can_be_called_repeatedly() {
        init_logging();
        init_logging();
    }

    #[test]
    fn write_timer_carries_its_target() {
        let timer = WriteTimer::start("glyphs/A");
        assert_eq!(timer.target, "glyphs/A");
    }
}
