//! Core domain types shared by the Bazel remote cache crates.
//!
//! This crate defines:
//! - Cache namespaces (`ac`, `cas`) and the composite storage key
//! - Layered application configuration

pub mod config;
pub mod error;
pub mod key;

pub use config::{AppConfig, ServerConfig, StorageConfig};
pub use error::{Error, Result};
pub use key::{CacheKey, Namespace};
