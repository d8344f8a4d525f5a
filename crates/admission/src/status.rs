//! Read-only status projections of limiters.

use serde::{Deserialize, Serialize};

/// Saturation as a percentage of the limit. Defined as 0 for a zero limit.
pub fn saturation_percentage(active: usize, limit: usize) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    active as f64 / limit as f64 * 100.0
}

/// Point-in-time status of one limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStatus {
    pub name: String,
    /// Holders between acquire and release.
    pub active: usize,
    /// `max(0, limit - active)`.
    pub available: usize,
    pub limit: usize,
    /// Acquires currently queued.
    pub waiting: usize,
    /// `active / limit * 100`.
    pub saturation: f64,
    /// When the limit last changed (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_resized_at: Option<String>,
}

impl LimiterStatus {
    /// No permit can be granted without a release.
    pub fn is_saturated(&self) -> bool {
        self.active >= self.limit
    }

    /// More holders than the limit allows, after a shrink.
    pub fn is_over_committed(&self) -> bool {
        self.active > self.limit
    }

    /// Human-readable status line.
    pub fn summary(&self) -> String {
        format!(
            "Limiter '{}' status: {}/{} active ({:.1}% saturated)",
            self.name, self.active, self.limit, self.saturation
        )
    }
}

/// Overall status reported by the health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Just started, no limiter registered yet
    #[default]
    Starting,
    /// Every limiter can admit work
    Ready,
    /// At least one limiter is saturated
    Busy,
}

impl Health {
    pub fn from_statuses(statuses: &[LimiterStatus]) -> Self {
        if statuses.is_empty() {
            Health::Starting
        } else if statuses.iter().any(LimiterStatus::is_saturated) {
            Health::Busy
        } else {
            Health::Ready
        }
    }
}
