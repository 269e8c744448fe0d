//! Domain model for the symbol cache
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Process identity that survives PID reuse checks
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Comm, Pid, ProcessFingerprint, UprobeKind, VersionInfo};

pub use errors::{CacheError, RegistryError, ResolutionError};
