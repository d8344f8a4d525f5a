//! Hands limit updates from the controller thread to the limiter's runtime.
//!
//! The policy fetch runs on a plain OS thread so a slow endpoint never stalls
//! the runtime serving `acquire`/`release`. Applying the fetched value is
//! scheduled onto the runtime the limiter captured from its callers, and the
//! controller waits a bounded time for the confirmation to come back.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use crate::permit::{AdmissionLimiter, LimitError, ResizeOutcome};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("No runtime has used limiter '{0}' yet")]
    RuntimeUnavailable(String),
    #[error("Limit update not confirmed within {0:?}")]
    Timeout(Duration),
    #[error("Limit update task was dropped before it ran")]
    Dropped,
    #[error("Limit update rejected: {0}")]
    Rejected(#[from] LimitError),
}

pub struct LimitBridge {
    limiter: Arc<AdmissionLimiter>,
    apply_timeout: Duration,
}

impl LimitBridge {
    pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(limiter: Arc<AdmissionLimiter>, apply_timeout: Duration) -> Self {
        Self {
            limiter,
            apply_timeout,
        }
    }

    /// Apply `limit` on the limiter's runtime and wait for the result.
    ///
    /// Blocks the calling thread for up to the apply timeout, so it must not
    /// be called from inside that runtime.
    pub fn submit(&self, limit: usize) -> Result<ResizeOutcome, BridgeError> {
        let handle = self
            .limiter
            .runtime()
            .ok_or_else(|| BridgeError::RuntimeUnavailable(self.limiter.name().to_string()))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let (tx, rx) = mpsc::sync_channel(1);
        let limiter = Arc::clone(&self.limiter);
        handle.spawn(async move {
            // Receiver gone means the controller already timed out.
            let _ = tx.send(limiter.set_limit(limit));
        });

        match rx.recv_timeout(self.apply_timeout) {
            Ok(result) => Ok(result?),
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout(self.apply_timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                // The runtime shut down; let the next caller's runtime take over.
                self.limiter.clear_runtime();
                Err(BridgeError::Dropped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_without_runtime_is_unavailable() {
        let limiter = AdmissionLimiter::new("api", 2).unwrap();
        let bridge = LimitBridge::new(Arc::clone(&limiter), Duration::from_millis(100));

        let err = bridge.submit(4).unwrap_err();
        assert!(matches!(err, BridgeError::RuntimeUnavailable(ref name) if name == "api"));
        assert_eq!(limiter.current_limit(), 2);
    }

    #[test]
    fn submit_applies_on_bound_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let limiter = AdmissionLimiter::new("api", 2).unwrap();
        assert!(limiter.bind_runtime(runtime.handle().clone()));
        let bridge = LimitBridge::new(Arc::clone(&limiter), Duration::from_secs(2));

        let outcome = bridge.submit(6).unwrap();
        assert_eq!(outcome.old_limit, 2);
        assert_eq!(outcome.new_limit, 6);
        assert_eq!(limiter.current_limit(), 6);
    }

    #[test]
    fn submit_times_out_when_runtime_is_not_driven() {
        // A current-thread runtime only runs tasks inside block_on.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let limiter = AdmissionLimiter::new("api", 2).unwrap();
        limiter.bind_runtime(runtime.handle().clone());
        let bridge = LimitBridge::new(Arc::clone(&limiter), Duration::from_millis(50));

        let err = bridge.submit(6).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(limiter.current_limit(), 2);
    }

    #[test]
    fn submit_after_runtime_shutdown_is_dropped() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let limiter = AdmissionLimiter::new("api", 2).unwrap();
        limiter.bind_runtime(runtime.handle().clone());
        drop(runtime);
        let bridge = LimitBridge::new(Arc::clone(&limiter), Duration::from_secs(1));

        let err = bridge.submit(6).unwrap_err();
        assert!(matches!(err, BridgeError::Dropped));
        assert_eq!(limiter.current_limit(), 2);
        assert!(limiter.runtime().is_none());

        let err = bridge.submit(6).unwrap_err();
        assert!(matches!(err, BridgeError::RuntimeUnavailable(_)));
    }

    #[test]
    fn submit_zero_is_rejected() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let limiter = AdmissionLimiter::new("api", 2).unwrap();
        limiter.bind_runtime(runtime.handle().clone());
        let bridge = LimitBridge::new(Arc::clone(&limiter), Duration::from_secs(2));

        let err = bridge.submit(0).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Rejected(LimitError::InvalidLimit(0))
        ));
    }
}
