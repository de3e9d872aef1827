use std::collections::VecDeque;

use parking_lot::Mutex;
use throttle_common::Direction;
use tokio::sync::oneshot;

/// Per-member FIFO of suspended requests, one queue per direction.
///
/// Resuming a request sends on its channel, which wakes the suspended task on whatever runtime
/// it is running on. The lock only guards the queues themselves and is always taken after the
/// group lock, never before.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    inner: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_ticket: u64,
    waiters: [VecDeque<(u64, oneshot::Sender<()>)>; 2],
}

/// A suspended request. Completes once the request is resumed.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) ticket: u64,
    pub(crate) rx: oneshot::Receiver<()>,
}

impl WaitQueue {
    /// Appends a new waiter to the back of the queue for `direction`.
    pub(crate) fn push(&self, direction: Direction) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters[direction.index()].push_back((ticket, tx));

        Waiter { ticket, rx }
    }

    /// Resumes the oldest waiter in `direction`. Returns `false` if there was none.
    pub(crate) fn resume_one(&self, direction: Direction) -> bool {
        let next = self.inner.lock().waiters[direction.index()].pop_front();

        match next {
            // The receiver is gone if the request is being dropped right now. Its pending
            // guard will not find it queued and passes the turn on instead.
            Some((_, tx)) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Resumes every waiter in `direction`, oldest first, and returns how many there were.
    pub(crate) fn resume_all(&self, direction: Direction) -> usize {
        let mut resumed = 0;
        while self.resume_one(direction) {
            resumed += 1;
        }

        resumed
    }

    /// Removes a waiter that gave up. Returns `false` if it was already resumed.
    pub(crate) fn remove(&self, direction: Direction, ticket: u64) -> bool {
        let mut state = self.inner.lock();
        let queue = &mut state.waiters[direction.index()];

        match queue.iter().position(|(t, _)| *t == ticket) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self, direction: Direction) -> usize {
        self.inner.lock().waiters[direction.index()].len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().waiters.iter().all(VecDeque::is_empty)
    }
}
