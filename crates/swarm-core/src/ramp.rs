use std::time::Duration;

/// Spawn ramp: users of one spawn batch are started `1 / spawn_rate` seconds apart,
/// strictly in index order.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRamp {
    users_per_sec: f64,
}

impl SpawnRamp {
    pub fn new(users_per_sec: f64) -> Self {
        Self { users_per_sec }
    }

    pub fn rate(&self) -> f64 {
        self.users_per_sec
    }

    /// Delay before the user at `idx` within its batch starts setup.
    pub fn start_offset(&self, idx: u32) -> Duration {
        if !self.users_per_sec.is_finite() || self.users_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        let millis = (idx as f64 * 1000.0 / self.users_per_sec).floor() as u64;
        Duration::from_millis(millis)
    }

    /// Time until the last of `count` users has been started.
    pub fn total_duration(&self, count: u32) -> Duration {
        match count {
            0 => Duration::ZERO,
            n => self.start_offset(n - 1),
        }
    }
}
