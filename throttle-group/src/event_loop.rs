use std::future::Future;

use tokio::{runtime::Handle, task::AbortHandle};

/// The execution context a member is bound to.
///
/// Timers of a member are spawned here, and so is everything that runs when they fire. Moving a
/// member to another runtime means unregistering it and registering it again with a different
/// event loop.
#[derive(Debug, Clone)]
pub struct EventLoop {
    handle: Handle,
}

impl EventLoop {
    /// Returns the event loop of the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn current() -> Self {
        Self { handle: Handle::current() }
    }

    /// Returns the event loop of the current Tokio runtime, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    /// Wraps the runtime behind `handle`.
    pub const fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// The Tokio handle timers are spawned on.
    #[inline]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawns a task on this event loop. Never runs the task inline, so it is safe to call while
    /// holding a lock the task itself will take.
    pub(crate) fn spawn<F>(&self, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task).abort_handle()
    }
}

impl From<Handle> for EventLoop {
    fn from(handle: Handle) -> Self {
        Self::from_handle(handle)
    }
}
