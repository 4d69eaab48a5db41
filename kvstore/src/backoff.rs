//! Exponential backoff for peer retries.
//!
//! Kept outside the transport so the transitions can be tested on their own.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Backoff parameters shared by every peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub floor: Duration,
    pub ceiling: Duration,
    pub growth_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(4),
            ceiling: Duration::from_secs(256),
            growth_factor: 2.0,
        }
    }
}

/// Per-peer retry state.
///
/// `on_failure` grows the interval by `growth_factor` (starting at `floor`,
/// capped at `ceiling`) and blocks retries for that long; `on_success` drops
/// back to `floor` and allows an immediate retry.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.floor,
            consecutive_failures: 0,
            retry_at: None,
        }
    }

    /// Interval that the next failure will impose.
    pub fn next_interval(&self) -> Duration {
        if self.consecutive_failures == 0 {
            self.config.floor
        } else {
            scale(self.current, self.config.growth_factor).min(self.config.ceiling)
        }
    }

    pub fn on_failure(&mut self, now: Instant) -> Duration {
        self.current = self.next_interval();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.retry_at = Some(now + self.current);
        self.current
    }

    pub fn on_success(&mut self) {
        self.current = self.config.floor;
        self.consecutive_failures = 0;
        self.retry_at = None;
    }

    pub fn should_retry(&self, now: Instant) -> bool {
        match self.retry_at {
            None => true,
            Some(at) => now >= at,
        }
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn current_interval(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_backing_off(&self, now: Instant) -> bool {
        !self.should_retry(now)
    }
}

// Whole-nanosecond scaling keeps integral factors exact.
fn scale(duration: Duration, factor: f64) -> Duration {
    let nanos = (duration.as_nanos() as f64 * factor).round();
    Duration::from_nanos(nanos.min(u64::MAX as f64) as u64)
}

/// Spread `base` uniformly by +/- `pct` percent.
pub fn add_jitter<R: Rng>(base: Duration, pct: u8, rng: &mut R) -> Duration {
    if pct == 0 || base.is_zero() {
        return base;
    }
    let spread = f64::from(pct.min(100)) / 100.0;
    let factor = rng.random_range((1.0 - spread)..=(1.0 + spread));
    scale(base, factor)
}
