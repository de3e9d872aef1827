use std::time::Duration;

use throttle_common::Direction;

use crate::{BucketConfig, BucketType, ConfigError, RateLimiter, ThrottleConfig};

/// Buckets consulted before a request in each direction may proceed.
const WAIT_BUCKETS: [[BucketType; 4]; 2] = [
    [BucketType::BpsTotal, BucketType::OpsTotal, BucketType::BpsRead, BucketType::OpsRead],
    [BucketType::BpsTotal, BucketType::OpsTotal, BucketType::BpsWrite, BucketType::OpsWrite],
];

/// Byte buckets charged by a request in each direction.
const SIZE_BUCKETS: [[BucketType; 2]; 2] =
    [[BucketType::BpsTotal, BucketType::BpsRead], [BucketType::BpsTotal, BucketType::BpsWrite]];

/// Operation buckets charged by a request in each direction.
const UNIT_BUCKETS: [[BucketType; 2]; 2] =
    [[BucketType::OpsTotal, BucketType::OpsRead], [BucketType::OpsTotal, BucketType::OpsWrite]];

/// Fill level of a single leaky bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LeakyBucket {
    /// Units accumulated and not yet leaked at the average rate.
    pub level: f64,
    /// Units accumulated and not yet leaked at the burst rate.
    pub burst_level: f64,
}

impl LeakyBucket {
    /// Leaks the bucket for `elapsed` worth of time.
    fn leak(&mut self, cfg: &BucketConfig, elapsed: f64) {
        self.level = (self.level - cfg.avg as f64 * elapsed).max(0.0);

        if cfg.burst_length > 1 {
            self.burst_level = (self.burst_level - cfg.max as f64 * elapsed).max(0.0);
        }
    }

    fn fill(&mut self, cfg: &BucketConfig, units: f64) {
        self.level += units;

        if cfg.burst_length > 1 {
            self.burst_level += units;
        }
    }

    /// Returns how long it takes until this bucket has room again.
    fn wait(&self, cfg: &BucketConfig) -> Duration {
        if cfg.avg == 0 {
            return Duration::ZERO;
        }

        let avg = cfg.avg as f64;
        let max = cfg.max as f64;

        // Without a burst rate we still allow a tenth of a second worth of I/O in one go,
        // otherwise every other request would be throttled.
        let (size, burst_size) = if cfg.max == 0 {
            (avg / 10.0, 0.0)
        } else {
            (max * cfg.burst_length as f64, max / 10.0)
        };

        // The main bucket is full.
        let extra = self.level - size;
        if extra > 0.0 {
            return secs(extra / avg);
        }

        // The main bucket still has room, but the burst rate is exceeded.
        if cfg.burst_length > 1 {
            let extra = self.burst_level - burst_size;
            if extra > 0.0 {
                return secs(extra / max);
            }
        }

        Duration::ZERO
    }
}

/// Converts a wait in seconds, saturating at [`Duration::MAX`] for waits no clock will reach.
fn secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// The default [`RateLimiter`]: six leaky buckets leaking at their configured rates.
///
/// Unconfigured, it never asks a request to wait.
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    config: ThrottleConfig,
    buckets: [LeakyBucket; 6],
    /// Time of the last leak.
    previous_leak: Duration,
}

impl Throttle {
    /// Creates a throttle with the given configuration, using `now` as the reference point.
    pub fn new(now: Duration, config: ThrottleConfig) -> Self {
        let mut throttle = Self::default();
        throttle.configure(now, config);
        throttle
    }

    /// Returns the current fill level of one bucket.
    #[inline]
    pub fn bucket(&self, ty: BucketType) -> &LeakyBucket {
        &self.buckets[ty.index()]
    }

    /// Leaks every bucket proportionally to the time elapsed since the previous leak.
    fn leak(&mut self, now: Duration) {
        let elapsed = now.saturating_sub(self.previous_leak);
        self.previous_leak = now;

        if elapsed.is_zero() {
            return;
        }

        let elapsed = elapsed.as_secs_f64();
        for (bucket, cfg) in self.buckets.iter_mut().zip(self.config.buckets()) {
            bucket.leak(cfg, elapsed);
        }
    }
}

impl RateLimiter for Throttle {
    type Config = ThrottleConfig;

    fn validate(config: &ThrottleConfig) -> Result<(), ConfigError> {
        config.validate()
    }

    fn configure(&mut self, now: Duration, config: ThrottleConfig) {
        tracing::debug!(enabled = config.is_enabled(), "configuring throttle");

        self.config = config;
        self.buckets = Default::default();
        self.previous_leak = now;
    }

    fn config(&self) -> ThrottleConfig {
        self.config.clone()
    }

    fn wait_time(&mut self, now: Duration, direction: Direction) -> Option<Duration> {
        self.leak(now);

        let wait = WAIT_BUCKETS[direction.index()]
            .into_iter()
            .map(|ty| self.buckets[ty.index()].wait(self.config.bucket(ty)))
            .max()
            .unwrap_or_default();

        (!wait.is_zero()).then_some(wait)
    }

    fn account(&mut self, direction: Direction, bytes: u64) {
        let op_size = self.config.get_op_size();
        let units = if op_size > 0 && bytes > op_size { bytes as f64 / op_size as f64 } else { 1.0 };

        for ty in SIZE_BUCKETS[direction.index()] {
            self.buckets[ty.index()].fill(self.config.bucket(ty), bytes as f64);
        }

        for ty in UNIT_BUCKETS[direction.index()] {
            self.buckets[ty.index()].fill(self.config.bucket(ty), units);
        }
    }
}
