//! Periodic liveness line on the operator log, emitted at `info`.

use tracing::info;

/// Default spacing between heartbeat lines, in milliseconds.
pub const DEFAULT_HEARTBEAT_MS: i64 = 180_000;

/// Tracks when the last heartbeat was emitted.
///
/// Starts at the epoch, so the first [`tick`](Self::tick) always fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    interval_ms: i64,
    last_ms: i64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_MS)
    }
}

impl Heartbeat {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last_ms: 0,
        }
    }

    /// Log `Process alive at millis: <now_ms>` if at least one interval has
    /// passed since the previous line. Returns whether a line was emitted.
    pub fn tick(&mut self, now_ms: i64) -> bool {
        if now_ms - self.last_ms < self.interval_ms {
            return false;
        }
        info!("Process alive at millis: {now_ms}");
        self.last_ms = now_ms;
        true
    }

    /// Time of the last emitted line, `0` before the first.
    pub fn last_ms(&self) -> i64 {
        self.last_ms
    }
}
