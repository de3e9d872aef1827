//! Leaky-bucket rate limiting for throttle groups: the [`RateLimiter`] interface, its
//! configuration and the default [`Throttle`] implementation.

use std::{fmt, time::Duration};

use thiserror::Error;
use throttle_common::Direction;

mod config;
mod throttle;
pub use config::*;
pub use throttle::*;

/// Errors produced while parsing or validating a throttle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A total limit was combined with a read or write limit of the same kind.
    #[error("{0} total and read/write limits cannot be used at the same time")]
    ConflictingLimits(&'static str),
    /// A rate or burst value exceeds [`THROTTLE_VALUE_MAX`].
    #[error("{bucket} values must be within [0, {max}]")]
    OutOfRange {
        /// The offending bucket.
        bucket: BucketType,
        /// The largest accepted value.
        max: u64,
    },
    /// A burst length of 0.
    #[error("the burst length of {0} cannot be 0")]
    ZeroBurstLength(BucketType),
    /// A burst length above 1 without a burst rate.
    #[error("{0}: burst length set without a burst rate")]
    BurstLengthWithoutRate(BucketType),
    /// The burst rate times the burst length exceeds [`THROTTLE_VALUE_MAX`].
    #[error("{0}: burst length too high for the configured burst rate")]
    BurstTooLong(BucketType),
    /// A burst rate without an average rate.
    #[error("{0}: a burst rate requires an average rate")]
    BurstWithoutAverage(BucketType),
    /// A burst rate below the average rate.
    #[error("{0}: the burst rate cannot be lower than the average rate")]
    BurstBelowAverage(BucketType),
    /// An option string named a key that is not a throttle option.
    #[error("Unknown throttle option: {0}")]
    UnknownKey(String),
    /// An option value that is not a non-negative integer.
    #[error("Invalid value {value:?} for throttle option {key}")]
    InvalidValue {
        /// The option name.
        key: String,
        /// The value as given.
        value: String,
    },
    /// An option string entry without `=`.
    #[error("Malformed throttle option: {0:?}")]
    Malformed(String),
}

/// The rate-limiting policy consulted by a throttle group.
///
/// A limiter only does the bucket math. It never sleeps, never arms timers and never touches
/// waiters: the group holds its lock while calling into the limiter and turns a returned wait
/// time into an armed timer on the right member.
///
/// Time is passed in explicitly as a [`Duration`] since the group clock's epoch.
pub trait RateLimiter: Default + Send + 'static {
    /// The configuration applied with [`RateLimiter::configure`].
    type Config: Clone + fmt::Debug + Send + Sync + 'static;

    /// Checks a configuration before it is applied. Must not have side effects.
    fn validate(config: &Self::Config) -> Result<(), ConfigError>;

    /// Applies a configuration, resetting all accumulated state. `now` becomes the reference
    /// point for the next leak.
    fn configure(&mut self, now: Duration, config: Self::Config);

    /// Returns a copy of the current configuration.
    fn config(&self) -> Self::Config;

    /// Returns how long a request in `direction` has to wait at `now`, or `None` if it may
    /// proceed right away.
    fn wait_time(&mut self, now: Duration, direction: Direction) -> Option<Duration>;

    /// Charges a request of `bytes` in `direction` against the budget.
    fn account(&mut self, direction: Direction, bytes: u64);
}
