//! Shared vocabulary for the throttle crates: I/O directions, the clock abstraction that drives
//! throttle timers, and a few byte-size constants.

use std::fmt;

mod clock;
pub use clock::{Clock, ClockType, RealtimeClock, Sleep, VirtualClock, VirtualSleep};

/// The direction of an I/O request. Limits and fairness are tracked independently for each
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Data flowing out of the storage backend.
    Read,
    /// Data flowing into the storage backend.
    Write,
}

impl Direction {
    /// Both directions, in index order.
    pub const ALL: [Self; 2] = [Self::Read, Self::Write];

    /// Returns the index of this direction in per-direction arrays (read = 0, write = 1).
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }

    /// Returns `true` for [`Direction::Write`].
    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Byte-size units.
#[allow(non_upper_case_globals)]
pub mod constants {
    /// One kibibyte.
    pub const KiB: u64 = 1024;
    /// One mebibyte.
    pub const MiB: u64 = 1024 * KiB;
    /// One gibibyte.
    pub const GiB: u64 = 1024 * MiB;
}
