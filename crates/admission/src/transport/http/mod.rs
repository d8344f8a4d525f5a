//! HTTP status and control server.

mod routes;
mod server;

pub use routes::{HealthCheckResponse, SetLimitRequest, routes};
pub use server::{ServerConfig, serve};
