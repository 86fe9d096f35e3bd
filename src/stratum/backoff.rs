//! Reconnect backoff and pool failover

use rand::Rng;
use std::time::Duration;

/// Base delay between reconnect attempts
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Cap on the exponent of the randomized window
const MAX_EXPONENT: u32 = 6;

/// Largest exponent a `u32` window can hold
const EXPONENT_LIMIT: u32 = u32::BITS - 1;

/// Failed attempts on one pool before moving to the next
const MAX_TRIES: u32 = 5;

/// Reconnect policy for the stratum session
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_exponent: u32,
    pub max_tries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_exponent: MAX_EXPONENT,
            max_tries: MAX_TRIES,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `tries`: the base delay times a random
    /// factor in `[1, 2^min(tries, max_exponent) - 1]`
    pub fn delay_with<R: Rng + ?Sized>(&self, tries: u32, rng: &mut R) -> Duration {
        let exponent = tries.min(self.max_exponent).min(EXPONENT_LIMIT);
        let window = (1u32 << exponent).saturating_sub(1).max(1);
        let factor = rng.random_range(1..=window);
        self.base_delay * factor
    }

    /// Delay before attempt number `tries` using the thread RNG
    pub fn delay(&self, tries: u32) -> Duration {
        self.delay_with(tries, &mut rand::rng())
    }
}

/// Running backoff state across failed connection attempts
#[derive(Debug, Clone, Default)]
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    tries: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, tries: 0 }
    }

    /// Failed attempts since the last reset
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Record a failure: returns the delay to wait and whether to fail over
    /// to the next pool, which restarts the count
    pub fn on_failure(&mut self) -> (Duration, bool) {
        self.tries += 1;
        let delay = self.policy.delay(self.tries);
        if self.tries > self.policy.max_tries {
            self.tries = 0;
            (delay, true)
        } else {
            (delay, false)
        }
    }
}
