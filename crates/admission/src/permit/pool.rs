//! Resizable permit pool.
//!
//! All capacity bookkeeping lives in one `CapacityState` behind a std mutex.
//! The lock is never held across an await point; `acquire` only suspends on
//! its waiter's oneshot receiver after the lock is dropped.
//!
//! `active` is incremented in exactly one place per permit: on the fast path
//! in `try_admit`, or under the lock at grant time in `release`/`set_limit`.
//! A woken waiter never touches the counters itself.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::guard::AdmissionPermit;
use super::waiter::{WaiterId, WaiterOutcome, WaiterQueue};
use crate::status::{LimiterStatus, saturation_percentage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("Limit must be positive, got {0}")]
    InvalidLimit(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("Acquire cancelled before a permit was granted")]
    Cancelled,
}

/// What a `set_limit` call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ResizeOutcome {
    pub old_limit: usize,
    pub new_limit: usize,
    /// Waiters granted a permit by a grow.
    pub woken: usize,
    /// Waiters cancelled by a shrink.
    pub cancelled: usize,
    /// `active` exceeds the new limit until enough holders release.
    pub over_committed: bool,
}

impl ResizeOutcome {
    fn unchanged(limit: usize, over_committed: bool) -> Self {
        Self {
            old_limit: limit,
            new_limit: limit,
            woken: 0,
            cancelled: 0,
            over_committed,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.old_limit == self.new_limit
    }
}

struct CapacityState {
    limit: usize,
    active: usize,
    available: usize,
    waiters: WaiterQueue,
    last_resized_at: Option<DateTime<Utc>>,
}

impl CapacityState {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            active: 0,
            available: limit,
            waiters: WaiterQueue::new(),
            last_resized_at: None,
        }
    }
}

enum Admission {
    Admitted,
    Queued(WaiterId, oneshot::Receiver<WaiterOutcome>),
}

/// Admission limiter with a limit that can change at runtime.
///
/// Construct one per upstream resource and hand the `Arc` to every caller
/// that talks to it.
pub struct AdmissionLimiter {
    name: String,
    state: Mutex<CapacityState>,
    /// Runtime the limit bridge schedules updates on. Cleared when that
    /// runtime is gone and re-captured by the next caller.
    runtime: Mutex<Option<Handle>>,
}

impl std::fmt::Debug for AdmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("AdmissionLimiter")
            .field("name", &self.name)
            .field("limit", &state.limit)
            .field("active", &state.active)
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl AdmissionLimiter {
    pub fn new(name: impl Into<String>, initial_limit: usize) -> Result<Arc<Self>, LimitError> {
        if initial_limit == 0 {
            return Err(LimitError::InvalidLimit(0));
        }

        Ok(Arc::new(Self {
            name: name.into(),
            state: Mutex::new(CapacityState::new(initial_limit)),
            runtime: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the capacity state, recovering from poison.
    ///
    /// Every critical section leaves the counters consistent before anything
    /// that could panic, so the inner value is still usable.
    fn lock_state(&self) -> MutexGuard<'_, CapacityState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(limiter = %self.name, "Limiter mutex poisoned - recovering state");
                poisoned.into_inner()
            }
        }
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Handle>> {
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pin the runtime that limit updates are applied on.
    ///
    /// Happens implicitly on acquire from inside a tokio runtime.
    /// Returns `false` if a runtime was already bound.
    pub fn bind_runtime(&self, handle: Handle) -> bool {
        let mut runtime = self.lock_runtime();
        if runtime.is_some() {
            return false;
        }
        *runtime = Some(handle);
        true
    }

    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.lock_runtime().clone()
    }

    /// Drop the bound runtime after it has shut down.
    pub(crate) fn clear_runtime(&self) {
        if self.lock_runtime().take().is_some() {
            tracing::debug!(limiter = %self.name, "Cleared stale runtime; waiting for next caller");
        }
    }

    fn capture_runtime(&self) {
        let mut runtime = self.lock_runtime();
        if runtime.is_none()
            && let Ok(handle) = Handle::try_current()
        {
            *runtime = Some(handle);
            tracing::debug!(limiter = %self.name, "Captured caller runtime");
        }
    }

    fn try_admit(&self) -> bool {
        let mut state = self.lock_state();
        if state.available == 0 {
            return false;
        }
        state.available -= 1;
        state.active += 1;
        self.log_status(&state);
        true
    }

    fn admit_or_enqueue(&self) -> Admission {
        let mut state = self.lock_state();
        if state.available > 0 {
            state.available -= 1;
            state.active += 1;
            self.log_status(&state);
            return Admission::Admitted;
        }
        let (id, rx) = state.waiters.push();
        tracing::trace!(limiter = %self.name, waiter = id, waiting = state.waiters.len(), "Queued acquire");
        Admission::Queued(id, rx)
    }

    /// Take a permit only if one is immediately available.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.capture_runtime();
        self.try_admit().then(|| AdmissionPermit::new(Arc::clone(self)))
    }

    /// Wait for a permit.
    ///
    /// Dropping the returned future cancels the acquire. If a permit was
    /// granted in the meantime it is released again, so nothing leaks.
    pub async fn acquire(self: &Arc<Self>) -> Result<AdmissionPermit, AcquireError> {
        self.capture_runtime();
        let (id, rx) = match self.admit_or_enqueue() {
            Admission::Admitted => return Ok(AdmissionPermit::new(Arc::clone(self))),
            Admission::Queued(id, rx) => (id, rx),
        };

        let mut pending = PendingAcquire::new(self, id, rx);
        let outcome = pending.wait().await;
        pending.finish(outcome)
    }

    /// Wait for a permit, giving up when `cancel` fires.
    ///
    /// If the grant and the cancellation race, exactly one wins under the
    /// limiter lock: either the permit is returned or `Cancelled` is, never both.
    pub async fn acquire_with_cancel(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AcquireError> {
        self.capture_runtime();
        let (id, rx) = match self.admit_or_enqueue() {
            Admission::Admitted => return Ok(AdmissionPermit::new(Arc::clone(self))),
            Admission::Queued(id, rx) => (id, rx),
        };

        let mut pending = PendingAcquire::new(self, id, rx);
        tokio::select! {
            biased;
            outcome = pending.wait() => pending.finish(outcome),
            _ = cancel.cancelled() => pending.abandon().ok_or(AcquireError::Cancelled),
        }
    }

    /// Return a permit to the pool.
    ///
    /// Normally called by dropping an [`AdmissionPermit`]; call directly only
    /// to pair with [`AdmissionPermit::forget`].
    pub fn release(&self) {
        let mut state = self.lock_state();
        if state.active == 0 {
            debug_assert!(false, "release without a matching acquire");
            tracing::error!(limiter = %self.name, "Bug: release called with no active holders");
            return;
        }
        state.active -= 1;

        // While over-committed after a shrink, releases only pay down the excess.
        if state.active < state.limit {
            if state.waiters.grant_head().is_some() {
                state.active += 1;
            } else {
                state.available = state.limit - state.active;
            }
        }
        self.log_status(&state);
    }

    /// Change the limit, reconciling the pool and the waiter queue.
    ///
    /// Growing grants queued waiters oldest first. Shrinking cancels queued
    /// waiters newest first until the queue fits what the pool can still admit.
    /// Holders above a shrunken limit keep their permits.
    pub fn set_limit(&self, new_limit: i64) -> Result<ResizeOutcome, LimitError> {
        if new_limit <= 0 {
            return Err(LimitError::InvalidLimit(new_limit));
        }
        let new_limit = usize::try_from(new_limit).map_err(|_| LimitError::InvalidLimit(new_limit))?;

        let mut state = self.lock_state();
        let old_limit = state.limit;
        if new_limit == old_limit {
            return Ok(ResizeOutcome::unchanged(
                old_limit,
                state.active > state.limit,
            ));
        }

        state.limit = new_limit;
        let mut woken = 0;
        let mut cancelled = 0;

        let over_committed = state.active > new_limit;
        if over_committed {
            state.available = 0;
            tracing::warn!(
                limiter = %self.name,
                active = state.active,
                new_limit,
                "Active holders exceed new limit; no admissions until enough release"
            );
        } else {
            state.available = new_limit - state.active;
            if new_limit > old_limit {
                let to_wake = state.waiters.len().min(state.available);
                for _ in 0..to_wake {
                    if state.waiters.grant_head().is_none() {
                        break;
                    }
                    state.available -= 1;
                    state.active += 1;
                    woken += 1;
                }
            }
        }

        if new_limit < old_limit {
            let allowed_waiting = new_limit.saturating_sub(state.active);
            while state.waiters.len() > allowed_waiting {
                if state.waiters.cancel_tail().is_none() {
                    break;
                }
                cancelled += 1;
            }
        }

        state.last_resized_at = Some(Utc::now());

        tracing::info!(
            limiter = %self.name,
            old_limit,
            new_limit,
            active = state.active,
            waiters = state.waiters.len(),
            woken,
            cancelled,
            "Limiter limit updated"
        );
        self.log_status(&state);

        Ok(ResizeOutcome {
            old_limit,
            new_limit,
            woken,
            cancelled,
            over_committed,
        })
    }

    pub fn active_count(&self) -> usize {
        self.lock_state().active
    }

    /// Permits grantable right now: `max(0, limit - active)`.
    pub fn available_permits(&self) -> usize {
        let state = self.lock_state();
        state.limit.saturating_sub(state.active)
    }

    pub fn current_limit(&self) -> usize {
        self.lock_state().limit
    }

    pub fn waiting_count(&self) -> usize {
        self.lock_state().waiters.len()
    }

    pub fn saturation_percentage(&self) -> f64 {
        let state = self.lock_state();
        saturation_percentage(state.active, state.limit)
    }

    /// Consistent snapshot of every status field.
    pub fn status(&self) -> LimiterStatus {
        let state = self.lock_state();
        LimiterStatus {
            name: self.name.clone(),
            active: state.active,
            available: state.limit.saturating_sub(state.active),
            limit: state.limit,
            waiting: state.waiters.len(),
            saturation: saturation_percentage(state.active, state.limit),
            last_resized_at: state.last_resized_at.map(|t| t.to_rfc3339()),
        }
    }

    /// Emit the status line for a state change.
    fn log_status(&self, state: &CapacityState) {
        tracing::debug!(
            limiter = %self.name,
            active = state.active,
            limit = state.limit,
            saturation = saturation_percentage(state.active, state.limit),
            "Limiter status"
        );
    }
}

/// A queued acquire. Removes its waiter from the queue if dropped unresolved.
struct PendingAcquire<'a> {
    limiter: &'a Arc<AdmissionLimiter>,
    id: WaiterId,
    rx: oneshot::Receiver<WaiterOutcome>,
    resolved: bool,
}

impl<'a> PendingAcquire<'a> {
    fn new(
        limiter: &'a Arc<AdmissionLimiter>,
        id: WaiterId,
        rx: oneshot::Receiver<WaiterOutcome>,
    ) -> Self {
        Self {
            limiter,
            id,
            rx,
            resolved: false,
        }
    }

    async fn wait(&mut self) -> WaiterOutcome {
        // The sender only disappears once the waiter has left the queue, so a
        // closed channel without a value means no permit was transferred.
        (&mut self.rx).await.unwrap_or(WaiterOutcome::Cancelled)
    }

    fn finish(&mut self, outcome: WaiterOutcome) -> Result<AdmissionPermit, AcquireError> {
        self.resolved = true;
        match outcome {
            WaiterOutcome::Granted => Ok(AdmissionPermit::new(Arc::clone(self.limiter))),
            WaiterOutcome::Cancelled => Err(AcquireError::Cancelled),
        }
    }

    /// Give up waiting. Returns the permit if a grant beat the cancellation.
    fn abandon(&mut self) -> Option<AdmissionPermit> {
        self.resolved = true;
        {
            let mut state = self.limiter.lock_state();
            if state.waiters.remove(self.id) {
                tracing::trace!(limiter = %self.limiter.name, waiter = self.id, "Acquire cancelled while queued");
                return None;
            }
        }
        // Already popped under the lock, so the outcome is in the channel.
        match self.rx.try_recv() {
            Ok(WaiterOutcome::Granted) => Some(AdmissionPermit::new(Arc::clone(self.limiter))),
            _ => None,
        }
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            // Dropping the late permit releases it straight back to the pool.
            drop(self.abandon());
        }
    }
}
