use std::sync::atomic::{AtomicU64, Ordering};

use throttle_common::Direction;

/// Statistics for a throttle group member, indexed by direction.
#[derive(Debug, Default)]
pub struct MemberStats {
    /// Requests that were admitted
    admitted: [AtomicU64; 2],
    /// Bytes charged against the group limit
    bytes: [AtomicU64; 2],
    /// Requests that had to be suspended before being admitted
    throttled: [AtomicU64; 2],
}

impl MemberStats {
    #[inline]
    pub(crate) fn record_admitted(&self, direction: Direction, bytes: u64) {
        self.admitted[direction.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[direction.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_throttled(&self, direction: Direction) {
        self.throttled[direction.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns how many requests in `direction` were admitted.
    #[inline]
    pub fn admitted(&self, direction: Direction) -> u64 {
        self.admitted[direction.index()].load(Ordering::Relaxed)
    }

    /// Returns how many bytes in `direction` were charged to the limiter.
    #[inline]
    pub fn bytes(&self, direction: Direction) -> u64 {
        self.bytes[direction.index()].load(Ordering::Relaxed)
    }

    /// Returns how many requests in `direction` were suspended at least once.
    #[inline]
    pub fn throttled(&self, direction: Direction) -> u64 {
        self.throttled[direction.index()].load(Ordering::Relaxed)
    }
}
