use std::time::Duration;

use tokio::task::AbortHandle;

/// A single-shot timer slot of one member in one direction.
///
/// Arming spawns a task that sleeps until the deadline and then calls back into the group with
/// the generation it was armed with. The callback only counts if that generation is still the
/// armed one, so a fire that races with a cancel or a re-arm is ignored.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    generation: u64,
    armed: Option<Armed>,
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    deadline: Duration,
    handle: AbortHandle,
}

impl Timer {
    #[inline]
    pub(crate) const fn is_pending(&self) -> bool {
        self.armed.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Duration> {
        self.armed.as_ref().map(|armed| armed.deadline)
    }

    /// Arms the timer. `spawn` receives the generation the fire has to report back.
    pub(crate) fn arm(&mut self, deadline: Duration, spawn: impl FnOnce(u64) -> AbortHandle) {
        debug_assert!(!self.is_pending(), "timer armed twice");

        self.generation += 1;
        let handle = spawn(self.generation);
        self.armed = Some(Armed { generation: self.generation, deadline, handle });
    }

    /// Cancels the timer. Returns `true` if it was pending.
    pub(crate) fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Marks the timer as fired. Returns `false` if `generation` is stale.
    pub(crate) fn fire(&mut self, generation: u64) -> bool {
        if self.armed.as_ref().is_some_and(|armed| armed.generation == generation) {
            self.armed = None;
            true
        } else {
            false
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
