//! HTTP server for the Bazel S3 remote cache.
//!
//! This crate provides:
//! - Bazel HTTP caching protocol endpoints (`/ac/{id}`, `/cas/{id}`)
//! - Prometheus metrics exposition (`/metrics`)
//! - The `bazel-s3-cache` server binary

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
