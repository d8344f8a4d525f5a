//! Transport layer for admission.
//!
//! Provides the HTTP status/control server via axum.

pub mod http;

pub use http::{ServerConfig, serve};
