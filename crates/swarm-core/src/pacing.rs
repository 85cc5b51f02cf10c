use rand::Rng;
use std::time::Duration;

use crate::config::PacingConfig;

/// Uniform wait between a virtual user's successive tasks.
///
/// Holds no random state of its own: every caller passes its own RNG, so two
/// users never share a pacing source.
#[derive(Debug, Clone, Copy)]
pub struct PacingController {
    min_wait_ms: u64,
    max_wait_ms: u64,
}

impl PacingController {
    /// Bounds are kept at millisecond resolution; sub-millisecond parts are dropped.
    pub fn new(min_wait: Duration, max_wait: Duration) -> anyhow::Result<Self> {
        if min_wait.is_zero() {
            anyhow::bail!("min_wait must be positive");
        }
        if min_wait < Duration::from_millis(1) {
            anyhow::bail!("min_wait ({min_wait:?}) is below the 1ms pacing resolution");
        }
        let min_wait_ms = u64::try_from(min_wait.as_millis())?;
        let max_wait_ms = u64::try_from(max_wait.as_millis())?;
        if min_wait_ms > max_wait_ms {
            anyhow::bail!("min_wait ({min_wait_ms}ms) exceeds max_wait ({max_wait_ms}ms)");
        }
        Ok(Self {
            min_wait_ms,
            max_wait_ms,
        })
    }

    pub fn from_config(config: &PacingConfig) -> anyhow::Result<Self> {
        Self::new(
            Duration::from_millis(config.min_wait_ms),
            Duration::from_millis(config.max_wait_ms),
        )
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_wait_ms),
            Duration::from_millis(self.max_wait_ms),
        )
    }

    pub fn next_wait<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_millis(rng.gen_range(self.min_wait_ms..=self.max_wait_ms))
    }
}
