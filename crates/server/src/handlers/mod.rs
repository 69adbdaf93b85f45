//! HTTP request handlers.

pub mod cache;

pub use cache::*;
