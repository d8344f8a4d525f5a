//! Limiter configuration.
//!
//! Loaded from a JSON file:
//!
//! ```json
//! {
//!   "limiters": [
//!     {"name": "api", "initial_limit": 10,
//!      "source_url": "http://policy/api_semaphore/concurrency_limit",
//!      "poll_interval_secs": 60}
//!   ]
//! }
//! ```
//!
//! or from the environment: `ADMISSION_LIMITERS=api=10,tasks=4` plus optional
//! `ADMISSION_<NAME>_URL` and `ADMISSION_<NAME>_INTERVAL` (seconds) per limiter.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::bridge::LimitBridge;
use crate::controller::ControllerConfig;
use crate::policy::HttpLimitSource;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

fn default_poll_interval() -> Duration {
    ControllerConfig::default().poll_interval
}

fn default_fetch_timeout() -> Duration {
    HttpLimitSource::DEFAULT_TIMEOUT
}

fn default_apply_timeout() -> Duration {
    LimitBridge::DEFAULT_APPLY_TIMEOUT
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    pub initial_limit: usize,
    /// Policy endpoint. No controller is started without one.
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(
        rename = "poll_interval_secs",
        default = "default_poll_interval",
        deserialize_with = "secs"
    )]
    pub poll_interval: Duration,
    #[serde(
        rename = "fetch_timeout_secs",
        default = "default_fetch_timeout",
        deserialize_with = "secs"
    )]
    pub fetch_timeout: Duration,
    #[serde(
        rename = "apply_timeout_secs",
        default = "default_apply_timeout",
        deserialize_with = "secs"
    )]
    pub apply_timeout: Duration,
}

impl LimiterConfig {
    pub fn new(name: impl Into<String>, initial_limit: usize) -> Self {
        Self {
            name: name.into(),
            initial_limit,
            source_url: None,
            poll_interval: default_poll_interval(),
            fetch_timeout: default_fetch_timeout(),
            apply_timeout: default_apply_timeout(),
        }
    }

    pub fn with_source(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("limiter name is empty".to_string()));
        }
        if self.initial_limit == 0 {
            return Err(ConfigError::Invalid(format!(
                "limiter '{}': initial_limit must be positive",
                self.name
            )));
        }
        if let Some(url) = &self.source_url
            && url.trim().is_empty()
        {
            return Err(ConfigError::Invalid(format!(
                "limiter '{}': source_url is empty",
                self.name
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "limiter '{}': poll_interval_secs must be positive",
                self.name
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "limiter '{}': fetch_timeout_secs must be positive",
                self.name
            )));
        }
        if self.apply_timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "limiter '{}': apply_timeout_secs must be positive",
                self.name
            )));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval: self.poll_interval,
            apply_timeout: self.apply_timeout,
            ..ControllerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

impl AdmissionConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), limiters = config.limiters.len(), "Loaded config");
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let Some(entries) = lookup("ADMISSION_LIMITERS") else {
            return Ok(Self::default());
        };

        let mut limiters = Vec::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, limit) = entry.split_once('=').ok_or_else(|| {
                ConfigError::Invalid(format!("expected name=limit in ADMISSION_LIMITERS, got '{entry}'"))
            })?;
            let name = name.trim();
            let initial_limit = limit.trim().parse::<usize>().map_err(|_| {
                ConfigError::Invalid(format!("limiter '{name}': bad limit '{}'", limit.trim()))
            })?;

            let mut limiter = LimiterConfig::new(name, initial_limit);
            let prefix = format!("ADMISSION_{}", env_key(name));
            if let Some(url) = lookup(&format!("{prefix}_URL")) {
                limiter = limiter.with_source(url);
            }
            if let Some(interval) = lookup(&format!("{prefix}_INTERVAL")) {
                let secs = interval.trim().parse::<u64>().map_err(|_| {
                    ConfigError::Invalid(format!("{prefix}_INTERVAL: bad seconds '{interval}'"))
                })?;
                limiter = limiter.with_poll_interval(Duration::from_secs(secs));
            }
            limiters.push(limiter);
        }

        let config = Self { limiters };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for limiter in &self.limiters {
            limiter.validate()?;
            if !seen.insert(limiter.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate limiter '{}'",
                    limiter.name
                )));
            }
        }
        Ok(())
    }
}

/// `api-gateway` -> `API_GATEWAY`
fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_config_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"limiters": [
                {{"name": "api", "initial_limit": 10, "source_url": "http://policy/limit"}},
                {{"name": "tasks", "initial_limit": 2, "poll_interval_secs": 5}}
            ]}}"#
        )
        .unwrap();

        let config = AdmissionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.limiters.len(), 2);

        let api = &config.limiters[0];
        assert_eq!(api.source_url.as_deref(), Some("http://policy/limit"));
        assert_eq!(api.poll_interval, Duration::from_secs(60));
        assert_eq!(api.fetch_timeout, Duration::from_secs(10));
        assert_eq!(api.apply_timeout, Duration::from_secs(5));

        let tasks = &config.limiters[1];
        assert_eq!(tasks.source_url, None);
        assert_eq!(tasks.poll_interval, Duration::from_secs(5));
        assert_eq!(tasks.controller_config().poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AdmissionConfig::from_file(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = AdmissionConfig::from_json_str("{\"limiters\": [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_limit_is_invalid() {
        let err =
            AdmissionConfig::from_json_str(r#"{"limiters": [{"name": "api", "initial_limit": 0}]}"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_timeouts_are_invalid() {
        let err = AdmissionConfig::from_json_str(
            r#"{"limiters": [{"name": "api", "initial_limit": 1, "fetch_timeout_secs": 0}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fetch_timeout_secs must be positive"));

        let err = AdmissionConfig::from_json_str(
            r#"{"limiters": [{"name": "api", "initial_limit": 1, "apply_timeout_secs": 0}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("apply_timeout_secs must be positive"));
    }

    #[test]
    fn duplicate_names_are_invalid() {
        let err = AdmissionConfig::from_json_str(
            r#"{"limiters": [
                {"name": "api", "initial_limit": 1},
                {"name": "api", "initial_limit": 2}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate limiter 'api'"));
    }

    #[test]
    fn env_config_reads_per_limiter_vars() {
        let config = AdmissionConfig::from_vars(vars(&[
            ("ADMISSION_LIMITERS", "api=10, batch-jobs=3"),
            ("ADMISSION_API_URL", "http://policy/api"),
            ("ADMISSION_BATCH_JOBS_INTERVAL", "15"),
        ]))
        .unwrap();

        assert_eq!(
            config.limiters,
            vec![
                LimiterConfig::new("api", 10).with_source("http://policy/api"),
                LimiterConfig::new("batch-jobs", 3).with_poll_interval(Duration::from_secs(15)),
            ]
        );
    }

    #[test]
    fn env_config_without_limiters_is_empty() {
        let config = AdmissionConfig::from_vars(vars(&[])).unwrap();
        assert!(config.limiters.is_empty());
    }

    #[test]
    fn env_config_rejects_bad_entries() {
        assert!(AdmissionConfig::from_vars(vars(&[("ADMISSION_LIMITERS", "api")])).is_err());
        assert!(AdmissionConfig::from_vars(vars(&[("ADMISSION_LIMITERS", "api=lots")])).is_err());
        assert!(
            AdmissionConfig::from_vars(vars(&[
                ("ADMISSION_LIMITERS", "api=2"),
                ("ADMISSION_API_INTERVAL", "0"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn env_key_normalizes_names() {
        assert_eq!(env_key("api-gateway.v2"), "API_GATEWAY_V2");
    }
}
