use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use throttle_common::Direction;
use throttle_limiter::{ConfigError, RateLimiter, Throttle};

use crate::{
    group::{GroupInner, ThrottleGroup},
    queue::WaitQueue,
    EventLoop, MemberId, MemberOptions, MemberStats, RegisterError, Registry,
};

/// Member state shared between the member handle and its group.
#[derive(Debug)]
pub(crate) struct MemberShared {
    pub(crate) id: MemberId,
    pub(crate) event_loop: EventLoop,
    pub(crate) queue: WaitQueue,
    /// Number of active reasons to bypass the limits. Limits apply while this is zero.
    limits_disabled: AtomicUsize,
    pub(crate) stats: MemberStats,
}

impl MemberShared {
    pub(crate) fn new(id: MemberId, event_loop: EventLoop, limits_disabled: bool) -> Self {
        Self {
            id,
            event_loop,
            queue: WaitQueue::default(),
            limits_disabled: AtomicUsize::new(usize::from(limits_disabled)),
            stats: MemberStats::default(),
        }
    }

    #[inline]
    pub(crate) fn limits_disabled(&self) -> bool {
        self.limits_disabled.load(Ordering::Acquire) > 0
    }
}

/// A participant in a throttle group, e.g. one disk sharing the group's I/O budget.
///
/// Every request goes through [`admit`](Self::admit) before it is issued. Dropping the member
/// unregisters it from its group, and the group is destroyed with its last member or handle.
///
/// # Example
///
/// ```no_run
/// use throttle_group::{Direction, MemberOptions, Registry};
///
/// # async fn example() {
/// let registry: Registry = Registry::default();
/// let disk = registry.register("disks", MemberOptions::default()).unwrap();
/// disk.set_config("iops-total=100".parse().unwrap()).unwrap();
///
/// disk.admit(4096, Direction::Write).await;
/// # }
/// ```
pub struct ThrottleGroupMember<L: RateLimiter = Throttle> {
    group: ThrottleGroup<L>,
    shared: Arc<MemberShared>,
}

impl<L: RateLimiter> ThrottleGroupMember<L> {
    /// Registers a new member of the group called `name`, creating the group if needed.
    ///
    /// The member is bound to the event loop from `options`, or to the current Tokio runtime.
    /// If this is the first member of the group it holds the turn in both directions.
    pub fn register(
        registry: &Registry<L>,
        name: &str,
        options: MemberOptions,
    ) -> Result<Self, RegisterError> {
        let event_loop = match options.event_loop {
            Some(event_loop) => event_loop,
            None => EventLoop::try_current().ok_or(RegisterError::NoEventLoop)?,
        };

        let group = registry.acquire_group(name);
        let shared = group.inner.register(event_loop, options.limits_disabled);

        tracing::debug!(group = name, member = %shared.id, "Registered throttle group member");

        Ok(Self { group, shared })
    }

    /// Unregisters the member. Same as dropping it.
    ///
    /// # Panics
    ///
    /// Panics if the member still has requests waiting.
    pub fn unregister(self) {
        drop(self);
    }

    /// Waits until a request of `bytes` in `direction` may be issued and charges it against the
    /// group's budget.
    ///
    /// Requests of one member complete in the order they were admitted. If the returned future
    /// is dropped while suspended, the request is withdrawn and charges nothing.
    pub async fn admit(&self, bytes: u64, direction: Direction) {
        let inner = &self.group.inner;

        let Some(waiter) = inner.admit(&self.shared, bytes, direction) else {
            return;
        };

        self.shared.stats.record_throttled(direction);
        tracing::debug!(
            group = %inner.name(),
            member = %self.shared.id,
            %direction,
            bytes,
            "Request throttled"
        );

        let mut guard = PendingGuard {
            group: inner,
            member: &self.shared,
            direction,
            ticket: waiter.ticket,
            done: false,
        };

        // The sender lives in our own queue, which we are borrowing.
        let _ = waiter.rx.await;
        guard.defuse();

        inner.resume(&self.shared, bytes, direction);
    }

    /// Validates `config` and applies it to the whole group.
    ///
    /// This member's timers are cancelled and one of its waiting requests per direction is
    /// resumed to re-evaluate against the new limits. An invalid configuration is rejected
    /// and the previous one stays in effect.
    pub fn set_config(&self, config: L::Config) -> Result<(), ConfigError> {
        self.group.inner.configure(Some(&self.shared), config)
    }

    /// Returns a copy of the group's configuration.
    pub fn get_config(&self) -> L::Config {
        self.group.config()
    }

    /// Resumes every waiting request of this member in both directions, bypassing the
    /// round-robin order.
    pub fn restart(&self) {
        for direction in Direction::ALL {
            let resumed = self.shared.queue.resume_all(direction);
            if resumed > 0 {
                tracing::debug!(member = %self.shared.id, %direction, resumed, "Restarted queue");
            }
        }
    }

    /// Disables the limits for this member until the guard is dropped. Guards nest.
    ///
    /// Taking the first guard restarts the member, so that nothing stays queued behind limits
    /// that no longer apply.
    pub fn disable_limits(&self) -> LimitsGuard<'_, L> {
        if self.shared.limits_disabled.fetch_add(1, Ordering::AcqRel) == 0 {
            self.restart();
        }

        LimitsGuard { member: self }
    }

    /// Returns `true` while a [`LimitsGuard`] or the registration option bypasses the limits.
    #[inline]
    pub fn limits_disabled(&self) -> bool {
        self.shared.limits_disabled()
    }

    /// This member's id within its group.
    #[inline]
    pub fn id(&self) -> MemberId {
        self.shared.id
    }

    /// The group this member belongs to.
    #[inline]
    pub const fn group(&self) -> &ThrottleGroup<L> {
        &self.group
    }

    /// Shorthand for `self.group().name()`.
    #[inline]
    pub fn group_name(&self) -> &str {
        self.group.name()
    }

    /// The event loop this member's timers run on.
    #[inline]
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    /// Counters of this member's requests.
    #[inline]
    pub fn stats(&self) -> &MemberStats {
        &self.shared.stats
    }

    /// Returns the number of requests in `direction` that are waiting or have just been
    /// resumed and not completed yet.
    pub fn pending(&self, direction: Direction) -> u32 {
        self.group.pending(self.shared.id, direction).unwrap_or_default()
    }

    /// Returns the number of requests in `direction` still suspended in the queue.
    pub fn queued(&self, direction: Direction) -> usize {
        self.shared.queue.len(direction)
    }

    /// Returns the deadline of this member's timer in `direction`, if one is armed.
    pub fn timer_deadline(&self, direction: Direction) -> Option<Duration> {
        self.group.inner.timer_deadline(self.shared.id, direction)
    }
}

impl<L: RateLimiter> Drop for ThrottleGroupMember<L> {
    fn drop(&mut self) {
        self.group.inner.unregister(&self.shared);
        tracing::debug!(
            group = %self.group.name(),
            member = %self.shared.id,
            "Unregistered throttle group member"
        );
    }
}

impl<L: RateLimiter> fmt::Debug for ThrottleGroupMember<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleGroupMember")
            .field("id", &self.shared.id)
            .field("group", &self.group.name())
            .field("limits_disabled", &self.limits_disabled())
            .finish_non_exhaustive()
    }
}

/// Keeps the limits of a member disabled. See [`ThrottleGroupMember::disable_limits`].
#[must_use = "limits are enabled again when the guard is dropped"]
#[derive(Debug)]
pub struct LimitsGuard<'a, L: RateLimiter = Throttle> {
    member: &'a ThrottleGroupMember<L>,
}

impl<L: RateLimiter> Drop for LimitsGuard<'_, L> {
    fn drop(&mut self) {
        self.member.shared.limits_disabled.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Withdraws a suspended request if its future is dropped before it is admitted.
struct PendingGuard<'a, L: RateLimiter> {
    group: &'a GroupInner<L>,
    member: &'a MemberShared,
    direction: Direction,
    ticket: u64,
    done: bool,
}

impl<L: RateLimiter> PendingGuard<'_, L> {
    fn defuse(&mut self) {
        self.done = true;
    }
}

impl<L: RateLimiter> Drop for PendingGuard<'_, L> {
    fn drop(&mut self) {
        if !self.done {
            tracing::trace!(
                member = %self.member.id,
                direction = %self.direction,
                "Request withdrawn"
            );
            self.group.abandon(self.member, self.direction, self.ticket);
        }
    }
}
