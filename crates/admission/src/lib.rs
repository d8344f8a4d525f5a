//! admission: dynamically resizable admission control for rate-limited APIs.
//!
//! An [`AdmissionLimiter`] bounds how many callers may be inside a critical
//! section at once. The bound can change while the limiter is in use: manually
//! via [`AdmissionLimiter::set_limit`], or by a [`LimitController`] polling a
//! remote policy endpoint on its own thread.

mod bridge;
pub mod config;
pub mod controller;
pub mod permit;
pub mod policy;
pub mod service;
mod status;
pub mod telemetry;
pub mod transport;
mod version;

pub use bridge::{BridgeError, LimitBridge};
pub use config::{AdmissionConfig, ConfigError, LimiterConfig};
pub use controller::{ControllerConfig, LimitController, LimitPoller, TickOutcome};
pub use permit::{
    AcquireError, AdmissionLimiter, AdmissionPermit, LimitError, ResizeOutcome, WaiterOutcome,
};
pub use policy::{FetchError, HttpLimitSource, LimitSource};
pub use service::{AdmissionService, HealthSnapshot, ServiceError};
pub use status::{Health, LimiterStatus, saturation_percentage};
pub use tokio_util::sync::CancellationToken;
pub use version::{ADMISSION_VERSION, VersionInfo};
