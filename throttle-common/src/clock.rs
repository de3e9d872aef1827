use std::{
    collections::BTreeMap,
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

/// The kind of time source behind a [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    /// Wall-clock time, backed by the Tokio timer.
    Realtime,
    /// Deterministic time that only moves when [`VirtualClock::advance`] is called.
    Virtual,
}

/// A time source for throttle timers and rate-limiter leaks.
///
/// Time is expressed as a [`Duration`] since the clock's own epoch, so that the rate limiter
/// never has to care which kind of clock is driving it.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Wall-clock time.
    Realtime(RealtimeClock),
    /// Manually advanced time, for tests.
    Virtual(VirtualClock),
}

impl Clock {
    /// Creates a wall-clock time source with its epoch set to now.
    pub fn realtime() -> Self {
        Self::Realtime(RealtimeClock::new())
    }

    /// Creates a virtual clock starting at zero. Use [`Clock::as_virtual`] or keep a clone of
    /// the inner [`VirtualClock`] to move it forward.
    pub fn virtual_clock() -> Self {
        Self::Virtual(VirtualClock::new())
    }

    /// Returns which kind of clock this is.
    pub const fn clock_type(&self) -> ClockType {
        match self {
            Self::Realtime(_) => ClockType::Realtime,
            Self::Virtual(_) => ClockType::Virtual,
        }
    }

    /// Returns the current time since the clock's epoch.
    #[inline]
    pub fn now(&self) -> Duration {
        match self {
            Self::Realtime(clock) => clock.now(),
            Self::Virtual(clock) => clock.now(),
        }
    }

    /// Returns a future that completes once the clock reaches `deadline`.
    ///
    /// For the realtime clock this must be called from within a Tokio runtime.
    pub fn sleep_until(&self, deadline: Duration) -> Sleep {
        match self {
            Self::Realtime(clock) => Sleep::Realtime(Box::pin(clock.sleep_until(deadline))),
            Self::Virtual(clock) => Sleep::Virtual(clock.sleep_until(deadline)),
        }
    }

    /// Returns the inner virtual clock, if this is one.
    pub const fn as_virtual(&self) -> Option<&VirtualClock> {
        match self {
            Self::Virtual(clock) => Some(clock),
            Self::Realtime(_) => None,
        }
    }
}

impl From<VirtualClock> for Clock {
    fn from(clock: VirtualClock) -> Self {
        Self::Virtual(clock)
    }
}

impl From<RealtimeClock> for Clock {
    fn from(clock: RealtimeClock) -> Self {
        Self::Realtime(clock)
    }
}

/// Stand-in deadline for sleeps that would never complete.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Wall-clock time source. Follows the Tokio clock, so it also honours paused time in tests.
#[derive(Debug, Clone, Copy)]
pub struct RealtimeClock {
    epoch: Instant,
}

impl RealtimeClock {
    /// Creates a clock whose epoch is the current Tokio instant.
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    /// Time elapsed since the epoch.
    #[inline]
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Sleeps until `deadline` past the epoch.
    pub fn sleep_until(&self, deadline: Duration) -> tokio::time::Sleep {
        match self.epoch.checked_add(deadline) {
            Some(deadline) => tokio::time::sleep_until(deadline),
            // Past what an `Instant` can hold, so as good as never.
            None => tokio::time::sleep(FAR_FUTURE),
        }
    }
}

impl Default for RealtimeClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A manually driven clock. Sleepers only complete when [`VirtualClock::advance`] or
/// [`VirtualClock::advance_to`] moves time past their deadline.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    inner: Arc<Mutex<VirtualState>>,
}

#[derive(Debug, Default)]
struct VirtualState {
    now: Duration,
    next_key: u64,
    /// Registered sleepers ordered by deadline, then by registration order.
    sleepers: BTreeMap<(Duration, u64), Waker>,
}

impl VirtualClock {
    /// Creates a virtual clock at time zero with no sleepers.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current virtual time.
    #[inline]
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Moves time forward by `by` and wakes every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        let target = self.now().saturating_add(by);
        self.advance_to(target);
    }

    /// Moves time forward to `target` (never backwards) and wakes every sleeper whose deadline
    /// has passed.
    pub fn advance_to(&self, target: Duration) {
        let due = {
            let mut state = self.inner.lock();
            if target > state.now {
                state.now = target;
            }
            let now = state.now;

            // Keys never reach u64::MAX, so this splits right after the last due sleeper.
            let later = state.sleepers.split_off(&(now, u64::MAX));
            mem::replace(&mut state.sleepers, later)
        };

        for waker in due.into_values() {
            waker.wake();
        }
    }

    /// Returns the earliest deadline among the registered sleepers, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.lock().sleepers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Moves time to the earliest registered deadline, if any, and returns it.
    pub fn advance_to_next(&self) -> Option<Duration> {
        let next = self.next_deadline()?;
        self.advance_to(next);
        Some(next)
    }

    /// Returns the number of sleepers that have been polled and are still waiting.
    pub fn sleepers(&self) -> usize {
        self.inner.lock().sleepers.len()
    }

    /// Returns a future that completes once the clock has been advanced to `deadline`.
    pub fn sleep_until(&self, deadline: Duration) -> VirtualSleep {
        VirtualSleep { clock: self.clone(), deadline, key: None }
    }
}

/// Future returned by [`VirtualClock::sleep_until`].
#[derive(Debug)]
pub struct VirtualSleep {
    clock: VirtualClock,
    deadline: Duration,
    key: Option<u64>,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.clock.inner.lock();

        if state.now >= this.deadline {
            if let Some(key) = this.key.take() {
                state.sleepers.remove(&(this.deadline, key));
            }

            return Poll::Ready(());
        }

        let key = match this.key {
            Some(key) => key,
            None => {
                let key = state.next_key;
                state.next_key += 1;
                this.key = Some(key);
                key
            }
        };

        state.sleepers.insert((this.deadline, key), cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for VirtualSleep {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.clock.inner.lock().sleepers.remove(&(self.deadline, key));
        }
    }
}

/// Future returned by [`Clock::sleep_until`].
#[derive(Debug)]
pub enum Sleep {
    /// We need the sleep to be pinned (`tokio::time::Sleep` is not `Unpin`).
    Realtime(Pin<Box<tokio::time::Sleep>>),
    /// Sleep on a [`VirtualClock`].
    Virtual(VirtualSleep),
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Self::Realtime(sleep) => sleep.as_mut().poll(cx),
            Self::Virtual(sleep) => Pin::new(sleep).poll(cx),
        }
    }
}
