//! Background limit controller.
//!
//! One OS thread per limiter polls its [`LimitSource`] and hands each fetched
//! value to the limiter's runtime through a [`LimitBridge`]. The thread sleeps
//! in short slices so `stop` is observed promptly even with long intervals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeError, LimitBridge};
use crate::permit::{AdmissionLimiter, ResizeOutcome};
use crate::policy::LimitSource;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    /// How long to wait for the runtime to confirm an update.
    pub apply_timeout: Duration,
    /// Sleep slice between stop checks.
    pub stop_check_interval: Duration,
    /// Upper bound on how long `stop` waits for the thread to exit.
    pub join_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            apply_timeout: LimitBridge::DEFAULT_APPLY_TIMEOUT,
            stop_check_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one fetch-and-apply cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Applied(ResizeOutcome),
    /// Fetched, but no live runtime is bound to the limiter. Retried next tick.
    Deferred(usize),
    /// Fetch failed; the limit was left as it was.
    FetchFailed(String),
    /// Fetched, but the runtime did not apply it.
    ApplyFailed(String),
}

/// Fetches a limit and applies it. Shared by the controller thread and
/// manual refreshes.
pub struct LimitPoller {
    limiter: Arc<AdmissionLimiter>,
    source: Arc<dyn LimitSource>,
    bridge: LimitBridge,
    last_known: AtomicUsize,
    deferred: Mutex<Option<usize>>,
}

impl LimitPoller {
    pub fn new(
        limiter: Arc<AdmissionLimiter>,
        source: Arc<dyn LimitSource>,
        apply_timeout: Duration,
    ) -> Self {
        let last_known = AtomicUsize::new(limiter.current_limit());
        Self {
            bridge: LimitBridge::new(Arc::clone(&limiter), apply_timeout),
            limiter,
            source,
            last_known,
            deferred: Mutex::new(None),
        }
    }

    /// Last value successfully fetched, or the initial limit if none yet.
    pub fn last_known_limit(&self) -> usize {
        self.last_known.load(Ordering::Acquire)
    }

    /// Fetched value still waiting for a runtime to apply it on.
    pub fn deferred_limit(&self) -> Option<usize> {
        *self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_deferred(&self, value: Option<usize>) {
        *self.deferred.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    /// Run one fetch-and-apply cycle. Blocks; call off the runtime.
    pub fn tick(&self) -> TickOutcome {
        let name = self.limiter.name();
        let limit = match self.source.fetch_limit() {
            Ok(limit) => limit,
            Err(e) => {
                tracing::warn!(
                    limiter = %name,
                    source = %self.source.describe(),
                    error = %e,
                    last_known = self.last_known_limit(),
                    "Failed to fetch limit; keeping current limit"
                );
                return TickOutcome::FetchFailed(e.to_string());
            }
        };

        self.last_known.store(limit, Ordering::Release);
        tracing::trace!(limiter = %name, limit, "Fetched limit");

        match self.bridge.submit(limit) {
            Ok(outcome) => {
                self.set_deferred(None);
                TickOutcome::Applied(outcome)
            }
            Err(e @ (BridgeError::RuntimeUnavailable(_) | BridgeError::Dropped)) => {
                tracing::debug!(
                    limiter = %name,
                    limit,
                    reason = %e,
                    "No live runtime; limit will be applied on a later fetch"
                );
                self.set_deferred(Some(limit));
                TickOutcome::Deferred(limit)
            }
            Err(e) => {
                tracing::error!(limiter = %name, limit, error = %e, "Failed to apply fetched limit");
                TickOutcome::ApplyFailed(e.to_string())
            }
        }
    }
}

/// Handle to a running controller thread. Dropping it stops the thread.
///
/// Outside a runtime, drop waits up to `join_timeout` for the thread. Inside
/// one it only signals stop and detaches; call [`LimitController::stop`] from
/// a blocking context to wait for the exit.
pub struct LimitController {
    name: String,
    poller: Arc<LimitPoller>,
    stop: CancellationToken,
    thread: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl LimitController {
    pub fn spawn(
        limiter: Arc<AdmissionLimiter>,
        source: Arc<dyn LimitSource>,
        config: ControllerConfig,
    ) -> std::io::Result<Self> {
        let name = limiter.name().to_string();
        let described = source.describe();
        let poller = Arc::new(LimitPoller::new(limiter, source, config.apply_timeout));
        let stop = CancellationToken::new();

        let thread = {
            let poller = Arc::clone(&poller);
            let stop = stop.clone();
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("limit-updater-{name}"))
                .spawn(move || run(&poller, &stop, &config))?
        };

        tracing::info!(
            limiter = %name,
            source = %described,
            interval_secs = config.poll_interval.as_secs_f64(),
            "Started limit controller"
        );

        Ok(Self {
            name,
            poller,
            stop,
            thread: Some(thread),
            join_timeout: config.join_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_known_limit(&self) -> usize {
        self.poller.last_known_limit()
    }

    pub fn poller(&self) -> Arc<LimitPoller> {
        Arc::clone(&self.poller)
    }

    /// Fetch and apply now, outside the polling schedule. Blocks.
    pub fn tick(&self) -> TickOutcome {
        self.poller.tick()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and wait (bounded) for it to exit. Idempotent.
    pub fn stop(&mut self) {
        self.stop.cancel();
        let Some(thread) = self.thread.take() else {
            return;
        };

        let deadline = Instant::now() + self.join_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    limiter = %self.name,
                    timeout_secs = self.join_timeout.as_secs_f64(),
                    "Limit controller did not stop in time; detaching"
                );
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        if thread.join().is_err() {
            tracing::error!(limiter = %self.name, "Limit controller thread panicked");
        } else {
            tracing::info!(limiter = %self.name, "Stopped limit controller");
        }
    }
}

impl Drop for LimitController {
    fn drop(&mut self) {
        // Never block a runtime worker on the join; the thread still exits
        // at its next stop check.
        if tokio::runtime::Handle::try_current().is_ok() {
            self.stop.cancel();
            if self.thread.take().is_some() {
                tracing::debug!(limiter = %self.name, "Detached limit controller dropped inside runtime");
            }
            return;
        }
        self.stop();
    }
}

fn run(poller: &LimitPoller, stop: &CancellationToken, config: &ControllerConfig) {
    while sleep_unless_stopped(stop, config.poll_interval, config.stop_check_interval) {
        poller.tick();
    }
}

/// Sleep for `total` in slices. Returns `false` if stop was requested.
fn sleep_unless_stopped(stop: &CancellationToken, total: Duration, slice: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}
