//! Exponential backoff for broker reconnection.
//!
//! After a connection is lost or a connection attempt fails, the kernel waits
//! before trying again. The wait grows multiplicatively and is capped:
//!
//! ```text
//! delay[n] = min(initial * factor^(n-1), max_delay)
//! ```
//!
//! With the defaults (initial=4s, factor=2, max=600s):
//! - Attempt 1: wait 4s
//! - Attempt 2: wait 8s
//! - Attempt 3: wait 16s
//! - ...
//! - Attempt 8: wait 512s
//! - Attempt 9+: wait 600s (capped)
//!
//! The schedule never gives up. A broker outage is never fatal to the service,
//! so the kernel keeps retrying at the capped delay for as long as it runs.
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use tessw_mqtt::Backoff;
//!
//! let mut backoff = Backoff::default();
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(4));
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(8));
//!
//! // Connection established again
//! backoff.reset();
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(4));
//! ```

use std::time::Duration;

/// Initial reconnection delay.
pub const INITIAL_DELAY: Duration = Duration::from_secs(4);

/// Multiplicative growth factor between consecutive attempts.
pub const FACTOR: f64 = 2.0;

/// Upper bound for a single reconnection delay.
pub const MAX_DELAY: Duration = Duration::from_secs(600);

/// Exponential backoff controller for connection retry logic.
///
/// Each call to [`Backoff::next_sleep`] returns the current delay and grows the
/// next one. [`Backoff::reset`] brings the schedule back to the initial delay and
/// must be called once a connection is established.
///
/// The controller is plain data. The connection kernel owns it exclusively, so no
/// locking is involved.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The delay returned by the first attempt after a reset.
    initial_delay: Duration,

    /// The delay that the next call to `next_sleep` will return.
    current_delay: Duration,

    /// Cap applied after every multiplication.
    max_delay: Duration,

    /// Growth factor applied after each attempt.
    factor: f64,

    /// Attempts since the last reset.
    attempt: u32,
}

impl Backoff {
    /// Creates a new backoff controller with custom timing parameters.
    ///
    /// A `factor` below 1.0 is clamped to 1.0, which yields a constant delay.
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            factor: factor.max(1.0),
            attempt: 0,
        }
    }

    /// Resets the schedule to the initial delay.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the schedule.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let sleep = self.current_delay;

        let next_delay_secs = self.current_delay.as_secs_f64() * self.factor;
        self.current_delay = Duration::from_secs_f64(next_delay_secs).min(self.max_delay);

        sleep
    }

    /// Gets the configured maximum delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Gets the number of attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Gets the delay that the next call to `next_sleep` will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// 4 seconds initial delay, doubling, capped at 10 minutes.
    fn default() -> Self {
        Self::new(INITIAL_DELAY, MAX_DELAY, FACTOR)
    }
}
