// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policies for operations racing against asynchronous host state.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// A policy which allows a fixed number of attempts with a constant delay
/// between them.
///
/// The first attempt is not counted as a retry: `FixedAttempts::new(3, d)`
/// runs the operation at most three times and sleeps `d` twice.
#[derive(Clone, Debug)]
pub struct FixedAttempts {
    attempts: usize,
    delay: Duration,
    retries_left: usize,
}

impl FixedAttempts {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        let attempts = attempts.max(1);
        Self { attempts, delay, retries_left: attempts - 1 }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Backoff for FixedAttempts {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        Some(self.delay)
    }

    fn reset(&mut self) {
        self.retries_left = self.attempts - 1;
    }
}

/// Attempts made when looking up a freshly exported Fibre Channel LUN.
pub const LUN_LOOKUP_ATTEMPTS: usize = 3;

/// Delay between Fibre Channel LUN lookups.
pub const LUN_LOOKUP_DELAY: Duration = Duration::from_secs(2);

/// Attempts made when a statistics read races with a CPU set change.
pub const STAT_READ_ATTEMPTS: usize = 3;

/// Return the policy used while waiting for a LUN to become visible.
pub fn lun_lookup_policy() -> FixedAttempts {
    FixedAttempts::new(LUN_LOOKUP_ATTEMPTS, LUN_LOOKUP_DELAY)
}

/// Return the policy used for consistent statistics reads.
///
/// The generation number either settles immediately or the CPU set is
/// still moving, so there is no delay between attempts.
pub fn stat_read_policy() -> FixedAttempts {
    FixedAttempts::new(STAT_READ_ATTEMPTS, Duration::ZERO)
}

/// Return a backoff policy for polling a volume service which is expected
/// to finish an operation in a relatively short amount of time.
pub fn volume_poll_policy() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(5);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..::backoff::ExponentialBackoff::default()
    }
}

/// Return a policy which retries immediately, forever. Used by tests.
pub fn immediate_policy() -> ::backoff::ExponentialBackoff {
    policy_with_max(Duration::ZERO, Duration::ZERO)
}
