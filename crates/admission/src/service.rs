//! AdmissionService: registry of named limiters and their controllers.
//!
//! Transports go through this service to list, inspect and resize limiters.
//! It also owns shutdown coordination for the status server.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::{AdmissionConfig, ConfigError, LimiterConfig};
use crate::controller::{LimitController, TickOutcome};
use crate::permit::{AdmissionLimiter, LimitError, ResizeOutcome};
use crate::policy::{HttpLimitSource, LimitSource};
use crate::status::{Health, LimiterStatus};
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Limiter '{0}' is already registered")]
    DuplicateLimiter(String),
    #[error("Unknown limiter '{0}'")]
    UnknownLimiter(String),
    #[error("Limiter '{0}' has no policy source")]
    NoPolicySource(String),
    #[error(transparent)]
    Limit(#[from] LimitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to start limit controller: {0}")]
    Controller(#[from] std::io::Error),
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub limiters: Vec<LimiterStatus>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == Health::Ready
    }

    pub fn is_busy(&self) -> bool {
        self.state == Health::Busy
    }
}

/// Registry of named limiters.
///
/// Dropping the service inside a runtime only signals its controllers to stop.
/// Call [`AdmissionService::stop_controllers`] from a blocking context (as
/// `serve` does via `spawn_blocking`) to wait for the threads to exit.
pub struct AdmissionService {
    limiters: DashMap<String, Arc<AdmissionLimiter>>,
    controllers: StdMutex<Vec<LimitController>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    version: VersionInfo,
}

impl Default for AdmissionService {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionService {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            limiters: DashMap::new(),
            controllers: StdMutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    /// Build a service with every limiter in `config` registered.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let service = Self::new();
        for limiter in &config.limiters {
            service.register(limiter)?;
        }
        Ok(service)
    }

    fn lock_controllers(&self) -> MutexGuard<'_, Vec<LimitController>> {
        match self.controllers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Controller list mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a limiter, starting an HTTP policy controller if it has a
    /// `source_url`.
    pub fn register(&self, config: &LimiterConfig) -> Result<Arc<AdmissionLimiter>, ServiceError> {
        let source = config.source_url.as_ref().map(|url| {
            Arc::new(HttpLimitSource::new(url.clone(), config.fetch_timeout)) as Arc<dyn LimitSource>
        });
        self.register_inner(config, source)
    }

    /// Register a limiter driven by a custom policy source.
    pub fn register_with_source(
        &self,
        config: &LimiterConfig,
        source: Arc<dyn LimitSource>,
    ) -> Result<Arc<AdmissionLimiter>, ServiceError> {
        self.register_inner(config, Some(source))
    }

    fn register_inner(
        &self,
        config: &LimiterConfig,
        source: Option<Arc<dyn LimitSource>>,
    ) -> Result<Arc<AdmissionLimiter>, ServiceError> {
        config.validate()?;

        let slot = match self.limiters.entry(config.name.clone()) {
            Entry::Occupied(_) => return Err(ServiceError::DuplicateLimiter(config.name.clone())),
            Entry::Vacant(slot) => slot,
        };

        let limiter = AdmissionLimiter::new(config.name.clone(), config.initial_limit)?;
        // Registered from inside the server runtime: updates go there.
        if let Ok(handle) = Handle::try_current() {
            limiter.bind_runtime(handle);
        }

        if let Some(source) = source {
            let controller = LimitController::spawn(
                Arc::clone(&limiter),
                source,
                config.controller_config(),
            )?;
            self.lock_controllers().push(controller);
        }

        slot.insert(Arc::clone(&limiter));
        tracing::info!(
            limiter = %config.name,
            initial_limit = config.initial_limit,
            "Registered limiter"
        );
        Ok(limiter)
    }

    pub fn limiter(&self, name: &str) -> Option<Arc<AdmissionLimiter>> {
        self.limiters.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn limiter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn status(&self, name: &str) -> Result<LimiterStatus, ServiceError> {
        self.limiter(name)
            .map(|limiter| limiter.status())
            .ok_or_else(|| ServiceError::UnknownLimiter(name.to_string()))
    }

    /// Status of every limiter, ordered by name.
    pub fn statuses(&self) -> Vec<LimiterStatus> {
        let mut statuses: Vec<LimiterStatus> =
            self.limiters.iter().map(|e| e.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn health(&self) -> HealthSnapshot {
        let limiters = self.statuses();
        HealthSnapshot {
            state: Health::from_statuses(&limiters),
            limiters,
            version: self.version.clone(),
        }
    }

    /// Operator override. The next controller fetch may change it again.
    pub fn set_limit(&self, name: &str, limit: i64) -> Result<ResizeOutcome, ServiceError> {
        let limiter = self
            .limiter(name)
            .ok_or_else(|| ServiceError::UnknownLimiter(name.to_string()))?;
        let outcome = limiter.set_limit(limit)?;
        tracing::info!(limiter = %name, limit, "Limit set manually");
        Ok(outcome)
    }

    /// Fetch and apply the policy limit now. Blocks; call off the runtime.
    pub fn refresh(&self, name: &str) -> Result<TickOutcome, ServiceError> {
        if !self.limiters.contains_key(name) {
            return Err(ServiceError::UnknownLimiter(name.to_string()));
        }
        let poller = self
            .lock_controllers()
            .iter()
            .find(|c| c.name() == name)
            .map(LimitController::poller)
            .ok_or_else(|| ServiceError::NoPolicySource(name.to_string()))?;
        Ok(poller.tick())
    }

    /// Log the status line of every limiter.
    pub fn log_statuses(&self) {
        for status in self.statuses() {
            tracing::info!(limiter = %status.name, "{}", status.summary());
        }
    }

    /// Stop every controller thread. Blocks up to each controller's join bound.
    pub fn stop_controllers(&self) {
        let controllers: Vec<LimitController> = self.lock_controllers().drain(..).collect();
        for mut controller in controllers {
            controller.stop();
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::policy::FetchError;

    fn fixed(limit: usize) -> Arc<dyn LimitSource> {
        Arc::new(move || -> Result<usize, FetchError> { Ok(limit) })
    }

    fn idle_config(name: &str, limit: usize) -> LimiterConfig {
        LimiterConfig::new(name, limit).with_poll_interval(Duration::from_secs(3600))
    }

    #[test]
    fn empty_service_is_starting() {
        let service = AdmissionService::new();
        let health = service.health();
        assert_eq!(health.state, Health::Starting);
        assert!(health.limiters.is_empty());
        assert_eq!(health.version.admission, crate::version::ADMISSION_VERSION);
    }

    #[test]
    fn health_reports_configured_version() {
        let service = AdmissionService::new().with_version(VersionInfo { admission: "9.9.9" });
        assert_eq!(service.health().version.admission, "9.9.9");
    }

    #[test]
    fn register_rejects_duplicates() {
        let service = AdmissionService::new();
        service.register(&LimiterConfig::new("api", 2)).unwrap();
        let err = service.register(&LimiterConfig::new("api", 5)).unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateLimiter(ref n) if n == "api"));
        assert_eq!(service.limiter("api").unwrap().current_limit(), 2);
    }

    #[test]
    fn register_rejects_invalid_config() {
        let service = AdmissionService::new();
        let err = service.register(&LimiterConfig::new("api", 0)).unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
        assert!(service.limiter("api").is_none());
    }

    #[test]
    fn statuses_are_sorted_and_health_tracks_saturation() {
        let service = AdmissionService::new();
        service.register(&LimiterConfig::new("tasks", 1)).unwrap();
        let api = service.register(&LimiterConfig::new("api", 2)).unwrap();

        assert_eq!(service.limiter_names(), vec!["api", "tasks"]);
        assert!(service.health().is_ready());

        let _a = api.try_acquire().unwrap();
        let _b = api.try_acquire().unwrap();
        let health = service.health();
        assert!(health.is_busy());
        assert_eq!(health.limiters[0].name, "api");
        assert_eq!(health.limiters[0].saturation, 100.0);
    }

    #[test]
    fn set_limit_resizes_and_validates() {
        let service = AdmissionService::new();
        service.register(&LimiterConfig::new("api", 2)).unwrap();

        let outcome = service.set_limit("api", 6).unwrap();
        assert_eq!((outcome.old_limit, outcome.new_limit), (2, 6));
        assert_eq!(service.status("api").unwrap().limit, 6);

        assert!(matches!(
            service.set_limit("api", 0),
            Err(ServiceError::Limit(LimitError::InvalidLimit(0)))
        ));
        assert!(matches!(
            service.set_limit("nope", 3),
            Err(ServiceError::UnknownLimiter(_))
        ));
    }

    #[test]
    fn refresh_requires_policy_source() {
        let service = AdmissionService::new();
        service.register(&LimiterConfig::new("api", 2)).unwrap();
        assert!(matches!(
            service.refresh("api"),
            Err(ServiceError::NoPolicySource(_))
        ));
        assert!(matches!(
            service.refresh("nope"),
            Err(ServiceError::UnknownLimiter(_))
        ));
    }

    #[test]
    fn refresh_applies_policy_limit() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = AdmissionService::new();
        let limiter = service
            .register_with_source(&idle_config("api", 2), fixed(9))
            .unwrap();
        limiter.bind_runtime(runtime.handle().clone());

        assert!(matches!(service.refresh("api").unwrap(), TickOutcome::Applied(_)));
        assert_eq!(limiter.current_limit(), 9);

        service.stop_controllers();
        assert!(matches!(
            service.refresh("api"),
            Err(ServiceError::NoPolicySource(_))
        ));
    }

    #[tokio::test]
    async fn register_inside_runtime_binds_it() {
        let service = AdmissionService::new();
        let limiter = service.register(&LimiterConfig::new("api", 2)).unwrap();
        assert!(!limiter.bind_runtime(Handle::current()));
    }

    #[tokio::test]
    async fn shutdown_signal_is_observed() {
        let service = AdmissionService::new();
        let mut rx = service.shutdown_rx();
        assert!(!*rx.borrow());
        service.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
