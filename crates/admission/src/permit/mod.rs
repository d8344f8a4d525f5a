//! Resizable permit pool for admission control.
//!
//! - `AdmissionLimiter` owns the capacity state and the waiter queue.
//! - `AdmissionPermit` returns its slot to the limiter on drop.
//! - `set_limit` grows (wakes the oldest waiters) or shrinks (cancels the
//!   newest waiters) the pool in place.

mod guard;
mod pool;
mod waiter;

pub use guard::AdmissionPermit;
pub use pool::{AcquireError, AdmissionLimiter, LimitError, ResizeOutcome};
pub use waiter::WaiterOutcome;
