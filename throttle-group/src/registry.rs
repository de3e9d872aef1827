use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use throttle_common::Clock;
use throttle_limiter::{RateLimiter, Throttle};

use crate::{
    group::{GroupInner, ThrottleGroup},
    MemberOptions, RegisterError, ThrottleGroupMember,
};

/// The set of live throttle groups, keyed by name.
///
/// Groups are created on first use and destroyed when their last handle goes away. The registry
/// only keeps weak references, so it never keeps a group alive on its own. All groups created by
/// one registry share its clock.
pub struct Registry<L: RateLimiter = Throttle> {
    inner: Arc<RegistryInner<L>>,
}

pub(crate) struct RegistryInner<L: RateLimiter> {
    groups: Mutex<FxHashMap<String, Weak<GroupInner<L>>>>,
    clock: Clock,
}

impl<L: RateLimiter> Registry<L> {
    /// Creates an empty registry whose groups all run on `clock`.
    pub fn new(clock: Clock) -> Self {
        Self { inner: Arc::new(RegistryInner { groups: Mutex::default(), clock }) }
    }

    /// The clock shared by all groups of this registry.
    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Returns a handle to the group called `name`, creating it with an unconfigured limiter if
    /// it does not exist yet.
    pub fn acquire_group(&self, name: &str) -> ThrottleGroup<L> {
        let mut groups = self.inner.groups.lock();

        // A dead entry means the group is being torn down right now; it removes its own entry
        // only if it still points at it, so replacing it here is fine.
        if let Some(group) = groups.get(name).and_then(Weak::upgrade) {
            return ThrottleGroup::from_inner(group);
        }

        let group = GroupInner::new(
            name.to_string(),
            self.inner.clock.clone(),
            L::default(),
            Arc::downgrade(&self.inner),
        );
        groups.insert(name.to_string(), Arc::downgrade(&group));
        tracing::debug!(group = name, "created throttle group");

        ThrottleGroup::from_inner(group)
    }

    /// Releases a handle obtained from [`Registry::acquire_group`]. The group is destroyed once
    /// its last handle is released.
    pub fn release_group(&self, group: ThrottleGroup<L>) {
        drop(group);
    }

    /// Registers a new member of the group called `name`. See [`ThrottleGroupMember::register`].
    pub fn register(
        &self,
        name: &str,
        options: MemberOptions,
    ) -> Result<ThrottleGroupMember<L>, RegisterError> {
        ThrottleGroupMember::register(self, name, options)
    }

    /// Returns `true` if a group called `name` is alive.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.groups.lock().get(name).is_some_and(|group| group.strong_count() > 0)
    }

    /// Returns the number of live groups.
    pub fn len(&self) -> usize {
        self.inner.groups.lock().values().filter(|group| group.strong_count() > 0).count()
    }

    /// Returns `true` if no group is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: RateLimiter> RegistryInner<L> {
    /// Removes the entry for a destroyed group, unless the name was taken over by a new group.
    pub(crate) fn forget(&self, name: &str) {
        let mut groups = self.groups.lock();
        if groups.get(name).is_some_and(|group| group.strong_count() == 0) {
            groups.remove(name);
            tracing::debug!(group = name, "destroyed throttle group");
        }
    }
}

impl<L: RateLimiter> Clone for Registry<L> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<L: RateLimiter> Default for Registry<L> {
    /// Creates a registry backed by the realtime clock.
    fn default() -> Self {
        Self::new(Clock::realtime())
    }
}

impl<L: RateLimiter> fmt::Debug for Registry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("groups", &self.len())
            .field("clock", &self.inner.clock.clock_type())
            .finish()
    }
}
