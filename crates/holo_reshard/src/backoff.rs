//! Exponential retry backoff with deterministic jitter.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::row::now_unix_ms;

const MAX_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `failures` (1-based) of the task identified by `seed`.
    ///
    /// Doubles per failure up to `max`, then jitters into [80%, 120%] so
    /// players retrying against the same tablet do not wake in lockstep.
    pub fn delay(&self, seed: impl Hash, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(MAX_SHIFT);
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let capped_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        seed.hash(&mut hasher);
        failures.hash(&mut hasher);
        now_unix_ms().hash(&mut hasher);
        let jitter_percent = 80u64 + (hasher.finish() % 41);
        Duration::from_millis((capped_ms.saturating_mul(jitter_percent) / 100).max(1))
    }
}
