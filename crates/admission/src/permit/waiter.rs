//! FIFO queue of acquires waiting for a permit.
//!
//! Each waiter owns the sending half of a oneshot channel. Resolving a waiter
//! (grant or cancel) always pops it from the queue first, so a waiter is never
//! signalled twice and never left behind after it is resolved.

use std::collections::VecDeque;

use tokio::sync::oneshot;

/// How a queued acquire was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterOutcome {
    /// A permit was transferred to the waiter.
    Granted,
    /// The waiter was dropped from the queue without a permit.
    Cancelled,
}

pub(crate) type WaiterId = u64;

struct Waiter {
    id: WaiterId,
    tx: oneshot::Sender<WaiterOutcome>,
}

#[derive(Default)]
pub(crate) struct WaiterQueue {
    waiters: VecDeque<Waiter>,
    next_id: WaiterId,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a waiter at the tail.
    pub fn push(&mut self) -> (WaiterId, oneshot::Receiver<WaiterOutcome>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, tx });
        (id, rx)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Grant the oldest waiter that is still listening.
    ///
    /// Waiters whose receiver is already gone are discarded on the way. Returns
    /// `None` when no live waiter was left to take the permit.
    pub fn grant_head(&mut self) -> Option<WaiterId> {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(WaiterOutcome::Granted).is_ok() {
                return Some(waiter.id);
            }
            tracing::trace!(waiter = waiter.id, "Skipping abandoned waiter");
        }
        None
    }

    /// Cancel the most recently enqueued waiter.
    pub fn cancel_tail(&mut self) -> Option<WaiterId> {
        let waiter = self.waiters.pop_back()?;
        // A closed receiver means the caller already gave up; nothing to signal.
        let _ = waiter.tx.send(WaiterOutcome::Cancelled);
        Some(waiter.id)
    }

    /// Remove a waiter by id. Returns `false` if it was already resolved.
    pub fn remove(&mut self, id: WaiterId) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}
