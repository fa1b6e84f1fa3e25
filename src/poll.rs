//! Bounded polling schedules shared by the provider and registry wait loops.

use std::time::{Duration, Instant};

/// Default interval between polls of a provider or registry listing.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default deadline for instances to reach the running state.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default deadline for runners to appear online in the registry.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Fixed-interval polling with an overall deadline.
///
/// Every wait loop in the crate takes one of these instead of hard-coding its
/// timing, so tests can shrink both values to milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSchedule {
    /// Delay between two consecutive polls.
    pub interval: Duration,
    /// Overall time budget for the wait.
    pub timeout: Duration,
}

impl PollSchedule {
    /// Creates a schedule from an interval and a timeout.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Returns the instant after which the loop must stop polling.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT)
    }
}
