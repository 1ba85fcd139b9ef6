//! Backoff strategy applied before a failed job becomes runnable again.
//!
//! The delay never blocks a worker: the retry policy stamps the job with a
//! future `run_at` and the normal polling path picks it back up.
//!
//! # Example
//!
//! ```
//! # use shellq::backoff::{Exponential, Strategy};
//! # use chrono::TimeDelta;
//! let strategy = Exponential::new(2.0).with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
//! assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
//! assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the attempt count, returns the [`TimeDelta`] to wait before the
    /// job should be retried.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Exponential backoff: `base^attempt` seconds, clamped to a maximum.
///
/// The base is the operator-configured `backoff_base` and may be fractional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exponential {
    base: f64,
    max: TimeDelta,
}

impl Exponential {
    /// Ceiling applied when no explicit maximum is configured. Keeps a large
    /// base or a deep attempt count from scheduling a retry into next century.
    pub const DEFAULT_MAX: TimeDelta = TimeDelta::days(7);

    pub const fn new(base: f64) -> Self {
        Self {
            base,
            max: Self::DEFAULT_MAX,
        }
    }

    /// Clamps the maximum value returned by [`Strategy::backoff`] to `max`.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = max;
        self
    }
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let seconds = self.base.powi(attempt.min(i32::MAX as u32) as i32);
        if !seconds.is_finite() {
            return self.max;
        }
        let millis = (seconds * 1000.0).round();
        let delta = if millis >= i64::MAX as f64 {
            self.max
        } else {
            TimeDelta::milliseconds(millis as i64)
        };
        delta.min(self.max).max(TimeDelta::zero())
    }
}
