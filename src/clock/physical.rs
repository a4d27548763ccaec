//! Physical Clock
//!
//! Wall-clock time plus an additive offset that Berkeley rounds adjust.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Node-local physical clock
#[derive(Debug, Clone, Default)]
pub struct PhysicalClock {
    offset_ms: i64,
}

impl PhysicalClock {
    /// Create a clock with no offset
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock that starts skewed by `offset_ms`
    pub fn with_offset(offset_ms: i64) -> Self {
        Self { offset_ms }
    }

    /// Adjusted current time
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(self.offset_ms)
    }

    /// Adjusted current time in milliseconds since the epoch
    pub fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Apply a correction received from the coordinator
    pub fn adjust(&mut self, delta_ms: i64) {
        self.offset_ms = self.offset_ms.saturating_add(delta_ms);
    }

    /// Accumulated offset from system time
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }
}
