//! Binary exponential backoff

use std::time::Duration;
use rand::Rng;

use ethersim_core::BackoffWindow;

use crate::BusConfig;

/// Truncated binary exponential backoff.
///
/// After the n-th attempt of a frame collides, the frame waits
/// `k * slot_time` with `k` uniform in `[0, 2^min(n, cap_exponent) - 1]`.
/// A draw of zero is raised to one slot so every wait is visible.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    slot_time: Duration,
    cap_exponent: u32,
}

impl BackoffPolicy {
    pub fn new(slot_time: Duration, cap_exponent: u32) -> Self {
        Self { slot_time, cap_exponent }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.slot_time, config.cap_exponent)
    }

    pub fn slot_time(&self) -> Duration {
        self.slot_time
    }

    /// Largest slot count that can be drawn after `attempts` attempts.
    pub fn max_slots(&self, attempts: u32) -> u32 {
        (1u32 << attempts.min(self.cap_exponent)) - 1
    }

    pub fn slots<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> u32 {
        let k = rng.random_range(0..=self.max_slots(attempts));
        k.max(1)
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        self.slot_time * self.slots(attempts, rng)
    }

    /// Independent delays for the frame already on the bus (`old_attempts`)
    /// and the frame that ran into it (`new_attempts`).
    pub fn compute_window<R: Rng + ?Sized>(
        &self,
        old_attempts: u32,
        new_attempts: u32,
        rng: &mut R,
    ) -> BackoffWindow {
        BackoffWindow {
            old_message: self.delay(old_attempts, rng),
            new_message: self.delay(new_attempts, rng),
        }
    }

    /// Mean slot count of the floored draw.
    pub fn expected_slots(&self, attempts: u32) -> f64 {
        let max = self.max_slots(attempts) as f64;
        // k = 0 counts as 1
        (1.0 + (max * (max + 1.0) / 2.0)) / (max + 1.0)
    }
}
