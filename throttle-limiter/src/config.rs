use std::{fmt, str::FromStr};

use crate::ConfigError;

/// Upper bound for any rate or burst value.
pub const THROTTLE_VALUE_MAX: u64 = 1_000_000_000_000_000;

/// The six leaky buckets of a throttle configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BucketType {
    /// Bytes per second, both directions.
    BpsTotal = 0,
    /// Bytes per second, reads.
    BpsRead = 1,
    /// Bytes per second, writes.
    BpsWrite = 2,
    /// Operations per second, both directions.
    OpsTotal = 3,
    /// Operations per second, reads.
    OpsRead = 4,
    /// Operations per second, writes.
    OpsWrite = 5,
}

impl BucketType {
    /// All buckets, in index order.
    pub const ALL: [Self; 6] =
        [Self::BpsTotal, Self::BpsRead, Self::BpsWrite, Self::OpsTotal, Self::OpsRead, Self::OpsWrite];

    /// Position of the bucket in per-bucket arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The option name of the bucket, e.g. `bps-total` or `iops-write`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::BpsTotal => "bps-total",
            Self::BpsRead => "bps-read",
            Self::BpsWrite => "bps-write",
            Self::OpsTotal => "iops-total",
            Self::OpsRead => "iops-read",
            Self::OpsWrite => "iops-write",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.name() == name)
    }
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Limits for a single leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    /// Average rate in units (bytes or operations) per second. Zero disables the bucket.
    pub avg: u64,
    /// Burst rate in units per second. Zero means no explicit burst.
    pub max: u64,
    /// How many seconds a burst at `max` may last.
    pub burst_length: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { avg: 0, max: 0, burst_length: 1 }
    }
}

/// A complete throttle configuration: six buckets plus the operation size used to count
/// large requests as several operations.
///
/// The default configuration is unlimited.
///
/// # Example
///
/// ```
/// use throttle_limiter::{BucketType, ThrottleConfig};
///
/// let cfg: ThrottleConfig = "bps-total=1048576,iops-write=100,iops-write-max=200".parse().unwrap();
/// assert_eq!(cfg.bucket(BucketType::BpsTotal).avg, 1048576);
/// assert_eq!(cfg.bucket(BucketType::OpsWrite).max, 200);
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleConfig {
    buckets: [BucketConfig; 6],
    /// Size of one operation in bytes for the iops buckets. Zero counts every request as one.
    op_size: u64,
}

impl ThrottleConfig {
    /// Sets the average rate of a bucket.
    pub fn limit(mut self, ty: BucketType, avg: u64) -> Self {
        self.buckets[ty.index()].avg = avg;
        self
    }

    /// Sets the burst rate of a bucket and how many seconds the burst may last.
    pub fn burst(mut self, ty: BucketType, max: u64, burst_length: u64) -> Self {
        let bucket = &mut self.buckets[ty.index()];
        bucket.max = max;
        bucket.burst_length = burst_length;
        self
    }

    /// Sets the operation size used to count large requests as several operations.
    pub fn op_size(mut self, op_size: u64) -> Self {
        self.op_size = op_size;
        self
    }

    /// Returns the settings of one bucket.
    #[inline]
    pub fn bucket(&self, ty: BucketType) -> &BucketConfig {
        &self.buckets[ty.index()]
    }

    /// Returns the settings of all buckets, indexed by [`BucketType::index`].
    #[inline]
    pub fn buckets(&self) -> &[BucketConfig; 6] {
        &self.buckets
    }

    /// The operation size set with [`ThrottleConfig::op_size`], or 0.
    #[inline]
    pub fn get_op_size(&self) -> u64 {
        self.op_size
    }

    /// Returns `true` if any bucket has an average rate, i.e. the configuration throttles.
    pub fn is_enabled(&self) -> bool {
        self.buckets.iter().any(|b| b.avg > 0)
    }

    /// Checks the configuration for conflicting or out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let set = |ty: BucketType| self.bucket(ty).avg > 0;

        if set(BucketType::BpsTotal) && (set(BucketType::BpsRead) || set(BucketType::BpsWrite)) {
            return Err(ConfigError::ConflictingLimits("bps"));
        }

        if set(BucketType::OpsTotal) && (set(BucketType::OpsRead) || set(BucketType::OpsWrite)) {
            return Err(ConfigError::ConflictingLimits("iops"));
        }

        for ty in BucketType::ALL {
            let bucket = self.bucket(ty);

            if bucket.avg > THROTTLE_VALUE_MAX || bucket.max > THROTTLE_VALUE_MAX {
                return Err(ConfigError::OutOfRange { bucket: ty, max: THROTTLE_VALUE_MAX });
            }

            if bucket.burst_length == 0 {
                return Err(ConfigError::ZeroBurstLength(ty));
            }

            if bucket.burst_length > 1 && bucket.max == 0 {
                return Err(ConfigError::BurstLengthWithoutRate(ty));
            }

            if bucket.max > 0 && bucket.burst_length > THROTTLE_VALUE_MAX / bucket.max {
                return Err(ConfigError::BurstTooLong(ty));
            }

            if bucket.max > 0 && bucket.avg == 0 {
                return Err(ConfigError::BurstWithoutAverage(ty));
            }

            if bucket.max > 0 && bucket.max < bucket.avg {
                return Err(ConfigError::BurstBelowAverage(ty));
            }
        }

        Ok(())
    }
}

impl FromStr for ThrottleConfig {
    type Err = ConfigError;

    /// Parses the comma-separated option syntax, e.g.
    /// `bps-total=1048576,iops-write-max=200,iops-write-max-length=5,iops-size=4096`.
    /// Keys may carry a `throttling.` prefix. The result is not validated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cfg = Self::default();

        for option in s.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) =
                option.split_once('=').ok_or_else(|| ConfigError::Malformed(option.to_string()))?;
            let key = key.trim();
            let key = key.strip_prefix("throttling.").unwrap_or(key);

            let value: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })?;

            if key == "iops-size" {
                cfg.op_size = value;
                continue;
            }

            let (name, field) = if let Some(name) = key.strip_suffix("-max-length") {
                (name, Field::BurstLength)
            } else if let Some(name) = key.strip_suffix("-max") {
                (name, Field::Max)
            } else {
                (key, Field::Avg)
            };

            let ty = BucketType::from_name(name)
                .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
            let bucket = &mut cfg.buckets[ty.index()];

            match field {
                Field::Avg => bucket.avg = value,
                Field::Max => bucket.max = value,
                Field::BurstLength => bucket.burst_length = value,
            }
        }

        Ok(cfg)
    }
}

enum Field {
    Avg,
    Max,
    BurstLength,
}
