//! Structured error types for the symbol cache
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Every type is `Clone`: all callers blocked on one cache build receive the
//! same failure value.

use super::types::Pid;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Process {0} not found")]
    NotFound(Pid),

    #[error("Binary {} cannot be read", path.display())]
    BinaryUnreadable { path: PathBuf },

    /// Informational: another caller is building the cache for this PID
    #[error("Symbol cache build for {0} already in progress")]
    CacheBuildInProgress(Pid),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Binary {} cannot be read", path.display())]
    BinaryUnreadable { path: PathBuf },

    #[error("Symbol {symbol} not found")]
    ResolutionFailed { symbol: String },

    #[error("Function {symbol} has {found} return sites, more than can be probed")]
    TooManyReturnSites { symbol: String, found: usize },

    #[error("No library matching {library} is mapped")]
    LibraryNotMapped { library: String },
}

impl ResolutionError {
    /// Whether the failure concerns the process as a whole rather than one symbol
    #[must_use]
    pub fn is_fatal_to_build(&self) -> bool {
        matches!(self, ResolutionError::BinaryUnreadable { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Uprobe {probe} on {binary} for {pid} is already registered")]
    AlreadyRegistered { pid: Pid, binary: String, probe: String },

    #[error("Uprobe is not registered")]
    NotRegistered,

    #[error("Uprobe cannot move from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}
