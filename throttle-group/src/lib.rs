//! Throttle groups: several members sharing one rate limit.
//!
//! Members join a group by name through a [`Registry`]. Every request passes through
//! [`ThrottleGroupMember::admit`], which either lets it proceed right away or suspends it until
//! the shared limiter has room again. Suspended requests are resumed one at a time and the
//! group hands the turn around its members in round-robin order, so a busy member cannot starve
//! a quiet one.
//!
//! Each member is bound to an [`EventLoop`]. Timers for a member always fire on its own event
//! loop, and a suspended request is only ever woken by a message to that loop.
use std::fmt;

use thiserror::Error;

mod event_loop;
mod group;
mod member;
mod queue;
mod registry;
mod stats;
mod timer;

pub use event_loop::EventLoop;
pub use group::ThrottleGroup;
pub use member::{LimitsGuard, ThrottleGroupMember};
pub use registry::Registry;
pub use stats::MemberStats;

pub use throttle_common::{Clock, ClockType, Direction, VirtualClock};
pub use throttle_limiter::{BucketType, ConfigError, RateLimiter, Throttle, ThrottleConfig};

/// Identifies a member within its group. Ids are never reused within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u64);

impl MemberId {
    /// The raw id.
    #[inline]
    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors returned when registering a member.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// No event loop was configured and there is no ambient runtime to default to.
    #[error("No event loop given and not called from within a Tokio runtime")]
    NoEventLoop,
}

/// Options for registering a [`ThrottleGroupMember`].
#[derive(Debug, Clone, Default)]
pub struct MemberOptions {
    /// The event loop the member's timers run on. Defaults to the current Tokio runtime.
    event_loop: Option<EventLoop>,
    /// Registers the member with limits disabled for its whole lifetime.
    limits_disabled: bool,
}

impl MemberOptions {
    /// Binds the member to the given event loop.
    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// If `true`, requests of this member bypass rate limiting and fairness until it is
    /// unregistered.
    pub const fn limits_disabled(mut self, disabled: bool) -> Self {
        self.limits_disabled = disabled;
        self
    }
}
