//! Remote limit policy sources.
//!
//! A policy endpoint answers `GET` with `{"limit": <positive integer>}`.
//! Fetches run on the limit controller's own thread, so the HTTP source uses
//! ureq (blocking) rather than an async client.

use std::time::Duration;

use serde::Deserialize;

use crate::version::ADMISSION_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Policy request failed: {0}")]
    Transport(String),
    #[error("Policy source returned status {0}")]
    Status(u16),
    #[error("Malformed policy payload: {0}")]
    Payload(String),
    #[error("Policy limit must be positive, got {0}")]
    NonPositive(i64),
}

/// Something that can tell the controller what the limit should be.
pub trait LimitSource: Send + Sync {
    /// Fetch the desired limit. Called from the controller thread; may block.
    fn fetch_limit(&self) -> Result<usize, FetchError>;

    /// Where the value comes from, for logs.
    fn describe(&self) -> String {
        "custom".to_string()
    }
}

impl<F> LimitSource for F
where
    F: Fn() -> Result<usize, FetchError> + Send + Sync,
{
    fn fetch_limit(&self) -> Result<usize, FetchError> {
        self()
    }
}

#[derive(Debug, Deserialize)]
struct LimitPayload {
    limit: serde_json::Value,
}

/// Validate a raw `limit` field from a policy payload.
pub fn validate_limit(raw: &serde_json::Value) -> Result<usize, FetchError> {
    let value = raw
        .as_i64()
        .ok_or_else(|| FetchError::Payload(format!("limit is not an integer: {raw}")))?;
    if value <= 0 {
        return Err(FetchError::NonPositive(value));
    }
    usize::try_from(value).map_err(|_| FetchError::Payload(format!("limit out of range: {value}")))
}

/// Policy source backed by an HTTP endpoint.
pub struct HttpLimitSource {
    url: String,
    agent: ureq::Agent,
    user_agent: String,
}

impl HttpLimitSource {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .new_agent();

        Self {
            url: url.into(),
            agent,
            user_agent: format!("admission/{}", ADMISSION_VERSION),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl LimitSource for HttpLimitSource {
    fn fetch_limit(&self) -> Result<usize, FetchError> {
        let mut response = self
            .agent
            .get(&self.url)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "application/json")
            .call()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(FetchError::Status(status));
        }

        let payload: LimitPayload = response
            .body_mut()
            .read_json()
            .map_err(|e| FetchError::Payload(e.to_string()))?;

        validate_limit(&payload.limit)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
