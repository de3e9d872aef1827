use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use throttle_common::{Clock, Direction};
use throttle_limiter::{ConfigError, RateLimiter, Throttle};

use crate::{
    member::MemberShared, queue::Waiter, registry::RegistryInner, timer::Timer, EventLoop,
    MemberId,
};

/// Delay of the timer that hands the turn to another member when no throttling is needed.
const IMMEDIATE: Duration = Duration::from_nanos(1);

/// A handle to a throttle group.
///
/// Handles are obtained from [`Registry::acquire_group`](crate::Registry::acquire_group) and are
/// reference counted: the group lives as long as any handle or member does.
pub struct ThrottleGroup<L: RateLimiter = Throttle> {
    pub(crate) inner: Arc<GroupInner<L>>,
}

pub(crate) struct GroupInner<L: RateLimiter> {
    name: String,
    clock: Clock,
    state: Mutex<GroupState<L>>,
    registry: Weak<RegistryInner<L>>,
    /// Handed to timer tasks, which must not keep the group alive.
    me: Weak<Self>,
}

/// Everything guarded by the group lock.
struct GroupState<L> {
    limiter: L,
    members: FxHashMap<MemberId, MemberSlot>,
    /// Round-robin order. New members are inserted at the front.
    order: Vec<MemberId>,
    /// The member whose turn it is, per direction. `None` only while the group has no members.
    tokens: [Option<MemberId>; 2],
    /// Whether some member of the group has a timer armed, per direction.
    any_timer_armed: [bool; 2],
    next_id: u64,
}

/// Group-side state of a member.
struct MemberSlot {
    shared: Arc<MemberShared>,
    /// Requests that entered the wait path and have not completed yet, per direction.
    pending: [u32; 2],
    timers: [Timer; 2],
}

impl<L: RateLimiter> GroupInner<L> {
    pub(crate) fn new(
        name: String,
        clock: Clock,
        limiter: L,
        registry: Weak<RegistryInner<L>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name,
            clock,
            state: Mutex::new(GroupState {
                limiter,
                members: FxHashMap::default(),
                order: Vec::new(),
                tokens: [None; 2],
                any_timer_armed: [false; 2],
                next_id: 0,
            }),
            registry,
            me: me.clone(),
        })
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn register(&self, event_loop: EventLoop, limits_disabled: bool) -> Arc<MemberShared> {
        let mut state = self.state.lock();

        let id = MemberId(state.next_id);
        state.next_id += 1;

        let shared = Arc::new(MemberShared::new(id, event_loop, limits_disabled));

        for token in &mut state.tokens {
            token.get_or_insert(id);
        }

        state.order.insert(0, id);
        state.members.insert(
            id,
            MemberSlot { shared: Arc::clone(&shared), pending: [0; 2], timers: Default::default() },
        );

        state.check_invariants();
        shared
    }

    /// Removes a member from the group.
    ///
    /// # Panics
    ///
    /// Panics if the member still has requests waiting, unless the thread is already panicking.
    pub(crate) fn unregister(&self, member: &MemberShared) {
        let id = member.id;
        let mut state = self.state.lock();

        let quiescent = state.slot(id).pending == [0; 2] && member.queue.is_empty();
        assert!(
            quiescent || std::thread::panicking(),
            "throttle group member {id} unregistered with requests in flight"
        );

        for d in Direction::ALL {
            if state.tokens[d.index()] == Some(id) {
                let next = state.next_member(id);
                state.tokens[d.index()] = (next != id).then_some(next);
            }
        }

        state.order.retain(|m| *m != id);
        let Some(mut slot) = state.members.remove(&id) else { return };

        // Requests of other members may be waiting on our timer to pass the turn on.
        for d in Direction::ALL {
            if slot.timers[d.index()].cancel() {
                state.any_timer_armed[d.index()] = false;

                if let Some(token) = state.tokens[d.index()] {
                    self.schedule_next_request(&mut state, token, d, false);
                }
            }
        }

        state.check_invariants();
    }

    /// Admits a request right away if it may proceed. Otherwise queues it behind the member's
    /// earlier requests and returns the waiter to suspend on.
    pub(crate) fn admit(&self, member: &MemberShared, bytes: u64, d: Direction) -> Option<Waiter> {
        let mut state = self.state.lock();

        if !member.limits_disabled() {
            let token = state.next_token(member.id, d);
            let must_wait = self.schedule_timer(&mut state, token, d);

            let slot = state.slot_mut(member.id);
            if must_wait || slot.pending[d.index()] > 0 {
                slot.pending[d.index()] += 1;
                let waiter = member.queue.push(d);

                state.check_invariants();
                return Some(waiter);
            }
        }

        self.charge(&mut state, member, bytes, d);
        None
    }

    /// Completes a request that was suspended and has been resumed.
    pub(crate) fn resume(&self, member: &MemberShared, bytes: u64, d: Direction) {
        let mut state = self.state.lock();
        state.slot_mut(member.id).pending[d.index()] -= 1;
        self.charge(&mut state, member, bytes, d);
    }

    /// Cleans up after a suspended request that was dropped before completing.
    pub(crate) fn abandon(&self, member: &MemberShared, d: Direction, ticket: u64) {
        let mut state = self.state.lock();
        let was_queued = member.queue.remove(d, ticket);
        state.slot_mut(member.id).pending[d.index()] -= 1;

        // It was already resumed and took the turn with it.
        if !was_queued {
            self.schedule_next_request(&mut state, member.id, d, false);
        }

        state.check_invariants();
    }

    fn charge(&self, state: &mut GroupState<L>, member: &MemberShared, bytes: u64, d: Direction) {
        tracing::trace!(group = %self.name, member = %member.id, direction = %d, bytes, "Admitted");
        state.limiter.account(d, bytes);
        member.stats.record_admitted(d, bytes);

        self.schedule_next_request(state, member.id, d, true);
        state.check_invariants();
    }

    /// Arms a timer on `token` if the limiter says requests in `d` have to wait.
    ///
    /// Returns `true` if the next request has to wait, either for the timer armed here or for
    /// one that was already armed.
    fn schedule_timer(&self, state: &mut GroupState<L>, token: MemberId, d: Direction) -> bool {
        if state.slot(token).shared.limits_disabled() {
            return false;
        }

        // Only one timer per direction in the whole group.
        if state.any_timer_armed[d.index()] {
            return true;
        }

        let now = self.clock.now();
        let Some(wait) = state.limiter.wait_time(now, d) else {
            return false;
        };

        tracing::debug!(group = %self.name, token = %token, direction = %d, ?wait, "Throttling");
        self.arm_timer(state, token, d, now.saturating_add(wait));
        state.tokens[d.index()] = Some(token);
        state.any_timer_armed[d.index()] = true;

        true
    }

    /// Passes the turn to the next member with requests waiting in `d`, and wakes one of them
    /// if the limiter allows it.
    ///
    /// With `prefer_own`, one of `tgm`'s own requests is resumed directly if it has any. Only
    /// the caller's own event loop may do that; everyone else goes through a timer on the
    /// token's event loop.
    fn schedule_next_request(
        &self,
        state: &mut GroupState<L>,
        tgm: MemberId,
        d: Direction,
        prefer_own: bool,
    ) {
        let token = state.next_token(tgm, d);
        if !state.has_pending(token, d) {
            return;
        }

        if self.schedule_timer(state, token, d) {
            return;
        }

        let token = if prefer_own && state.slot(tgm).shared.queue.resume_one(d) {
            tgm
        } else if state.any_timer_armed[d.index()] {
            // Only a token with limits disabled gets here while a timer is armed. Let it go
            // instead of arming a second timer.
            state.slot(token).shared.queue.resume_one(d);
            token
        } else {
            let deadline = self.clock.now() + IMMEDIATE;
            self.arm_timer(state, token, d, deadline);
            state.any_timer_armed[d.index()] = true;
            token
        };

        state.tokens[d.index()] = Some(token);
    }

    fn arm_timer(&self, state: &mut GroupState<L>, id: MemberId, d: Direction, deadline: Duration) {
        let MemberSlot { shared, timers, .. } = state.slot_mut(id);
        let timer = &mut timers[d.index()];

        if timer.is_pending() {
            return;
        }

        let group = self.me.clone();
        let clock = self.clock.clone();
        let event_loop = &shared.event_loop;

        timer.arm(deadline, |generation| {
            event_loop.spawn(async move {
                clock.sleep_until(deadline).await;

                if let Some(group) = group.upgrade() {
                    group.on_timer(id, d, generation);
                }
            })
        });

        tracing::debug!(group = %self.name, member = %id, direction = %d, ?deadline, "Armed timer");
    }

    /// Runs on the member's event loop when its timer fires.
    fn on_timer(&self, id: MemberId, d: Direction, generation: u64) {
        let member = {
            let mut state = self.state.lock();
            let Some(slot) = state.members.get_mut(&id) else { return };

            if !slot.timers[d.index()].fire(generation) {
                return;
            }

            let member = Arc::clone(&slot.shared);
            state.any_timer_armed[d.index()] = false;
            member
        };

        tracing::debug!(group = %self.name, member = %id, direction = %d, "Timer fired");

        // Nobody of ours is queued: the turn has to move on.
        if !member.queue.resume_one(d) {
            self.reschedule(id, d);
        }
    }

    fn reschedule(&self, id: MemberId, d: Direction) {
        let mut state = self.state.lock();
        if state.members.contains_key(&id) {
            self.schedule_next_request(&mut state, id, d, false);
            state.check_invariants();
        }
    }

    /// Validates and applies a new limiter configuration.
    ///
    /// If `member` is given, its timers are cancelled and one of its requests per direction is
    /// resumed so that it re-evaluates against the new limits.
    pub(crate) fn configure(
        &self,
        member: Option<&MemberShared>,
        config: L::Config,
    ) -> Result<(), ConfigError> {
        if let Err(err) = L::validate(&config) {
            tracing::warn!(group = %self.name, ?config, %err, "Rejected throttle configuration");
            return Err(err);
        }

        let mut cancelled = [false; 2];
        {
            let mut state = self.state.lock();

            if let Some(member) = member {
                for d in Direction::ALL {
                    if state.slot_mut(member.id).timers[d.index()].cancel() {
                        state.any_timer_armed[d.index()] = false;
                        cancelled[d.index()] = true;
                    }
                }
            }

            let now = self.clock.now();
            tracing::debug!(group = %self.name, ?config, "Configuring throttle group");
            state.limiter.configure(now, config);
            state.check_invariants();
        }

        if let Some(member) = member {
            for d in Direction::ALL {
                if !member.queue.resume_one(d) && cancelled[d.index()] {
                    self.reschedule(member.id, d);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn config(&self) -> L::Config {
        self.state.lock().limiter.config()
    }

    pub(crate) fn pending(&self, id: MemberId, d: Direction) -> Option<u32> {
        self.state.lock().members.get(&id).map(|slot| slot.pending[d.index()])
    }

    pub(crate) fn timer_deadline(&self, id: MemberId, d: Direction) -> Option<Duration> {
        self.state.lock().members.get(&id).and_then(|slot| slot.timers[d.index()].deadline())
    }
}

impl<L: RateLimiter> Drop for GroupInner<L> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(&self.name);
        }
    }
}

impl<L> GroupState<L> {
    #[inline]
    fn slot(&self, id: MemberId) -> &MemberSlot {
        self.members.get(&id).expect("throttle group member is registered")
    }

    #[inline]
    fn slot_mut(&mut self, id: MemberId) -> &mut MemberSlot {
        self.members.get_mut(&id).expect("throttle group member is registered")
    }

    #[inline]
    fn has_pending(&self, id: MemberId, d: Direction) -> bool {
        self.slot(id).pending[d.index()] > 0
    }

    #[inline]
    fn position(&self, id: MemberId) -> usize {
        self.order.iter().position(|m| *m == id).expect("throttle group member is registered")
    }

    /// The member after `id` in round-robin order, wrapping around.
    fn next_member(&self, id: MemberId) -> MemberId {
        self.order[(self.position(id) + 1) % self.order.len()]
    }

    /// Picks the member that should get the next turn in `d`: the first one after the current
    /// token that has requests waiting, or `tgm` if nobody has.
    fn next_token(&self, tgm: MemberId, d: Direction) -> MemberId {
        let start = self.tokens[d.index()].unwrap_or(tgm);
        let pos = self.position(start);
        let n = self.order.len();

        // Ends on `start` itself, after everyone else had a chance.
        (1..=n)
            .map(|i| self.order[(pos + i) % n])
            .find(|&m| self.has_pending(m, d))
            .unwrap_or(tgm)
    }

    fn armed_timers(&self, d: Direction) -> usize {
        self.members.values().filter(|slot| slot.timers[d.index()].is_pending()).count()
    }

    fn check_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        for d in Direction::ALL {
            let armed = self.armed_timers(d);
            assert!(armed <= 1, "{armed} {d} timers armed in one throttle group");
            assert_eq!(armed == 1, self.any_timer_armed[d.index()], "{d} timer flag out of sync");

            match self.tokens[d.index()] {
                Some(token) => assert!(self.members.contains_key(&token), "stale {d} token"),
                None => assert!(self.members.is_empty(), "no {d} token in a non-empty group"),
            }
        }
    }
}

impl<L: RateLimiter> ThrottleGroup<L> {
    pub(crate) const fn from_inner(inner: Arc<GroupInner<L>>) -> Self {
        Self { inner }
    }

    /// The name the group was created under.
    #[inline]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The clock driving the group's timers and limiter.
    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Returns a copy of the group's limiter configuration.
    pub fn config(&self) -> L::Config {
        self.inner.config()
    }

    /// Validates and applies a configuration to the whole group.
    ///
    /// Unlike [`ThrottleGroupMember::set_config`](crate::ThrottleGroupMember::set_config) this
    /// leaves armed timers alone, so it is meant for setting up a group before it sees traffic.
    pub fn configure(&self, config: L::Config) -> Result<(), ConfigError> {
        self.inner.configure(None, config)
    }

    /// Runs `f` with the group's limiter, under the group lock.
    pub fn with_limiter<R>(&self, f: impl FnOnce(&L) -> R) -> R {
        f(&self.inner.state.lock().limiter)
    }

    /// Returns the member whose turn it is in `d`.
    pub fn token(&self, d: Direction) -> Option<MemberId> {
        self.inner.state.lock().tokens[d.index()]
    }

    /// Returns `true` if some member has a timer armed in `d`.
    pub fn timer_armed(&self, d: Direction) -> bool {
        self.inner.state.lock().any_timer_armed[d.index()]
    }

    /// Returns how many members have a timer armed in `d`. Never more than one.
    pub fn armed_timers(&self, d: Direction) -> usize {
        self.inner.state.lock().armed_timers(d)
    }

    /// Returns the number of registered members.
    pub fn member_count(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    /// Returns the members in round-robin order.
    pub fn members(&self) -> Vec<MemberId> {
        self.inner.state.lock().order.clone()
    }

    /// Returns the number of requests of `member` waiting in `d`, or `None` if it is not a
    /// member of this group.
    pub fn pending(&self, member: MemberId, d: Direction) -> Option<u32> {
        self.inner.pending(member, d)
    }

    /// Returns the number of live handles to this group, members included.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns `true` if both handles point to the same group.
    pub fn same_group(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<L: RateLimiter> Clone for ThrottleGroup<L> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<L: RateLimiter> fmt::Debug for ThrottleGroup<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleGroup")
            .field("name", &self.inner.name)
            .field("config", &self.config())
            .finish_non_exhaustive()
    }
}
