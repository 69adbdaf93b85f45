//! Cache store implementations.

pub mod memory;
pub mod s3;
