//! Lamport Logical Clock

/// Monotonic per-node event counter
///
/// Only [`tick`](Self::tick) and [`merge`](Self::merge) change the value, and
/// neither can move it backwards.
#[derive(Debug, Clone, Default)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value without advancing
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Advance for a local send or a locally applied mutation
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Advance past a received timestamp
    pub fn merge(&mut self, received: u64) -> u64 {
        self.value = self.value.max(received) + 1;
        self.value
    }
}
