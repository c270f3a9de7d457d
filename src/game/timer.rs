//! Fixed-cadence timers driven by the session's millisecond tick counter.

/// A repeating timer. `update` reports whether the timeout elapsed and, when
/// it did, advances the base by exactly one period so the cadence does not
/// drift with late wakes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    ticks: u32,
}

impl Timer {
    pub fn new() -> Self {
        Self { ticks: 0 }
    }

    pub fn update(&mut self, cur_ticks: u32, timeout: u32) -> bool {
        if cur_ticks < self.ticks + timeout {
            return false;
        }
        self.ticks += timeout;
        true
    }

    pub fn reset(&mut self, cur_ticks: u32) {
        self.ticks = cur_ticks;
    }
}
