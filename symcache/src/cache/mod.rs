//! # Per-Process Symbol Cache
//!
//! A pid-keyed store of resolved symbols that notices pid reuse.
//!
//! ## Identity
//!
//! Each entry keeps the [`ProcessFingerprint`] captured when it was built.
//! A fresh fingerprint with a different start time or network namespace
//! means the pid now belongs to another process, and the entry is evicted
//! together with every uprobe resolved for the old instance.
//!
//! ## Concurrency
//!
//! ```text
//! table lock (short)      per-pid slot guard (held for a whole build)
//! ┌──────────────┐        ┌───────────────────────────────┐
//! │ pid → slot ──┼──────▶ │ Vacant | Ready | Failed | Evicted │
//! └──────────────┘        └───────────────────────────────┘
//! ```
//!
//! - At most one build per pid runs at a time; other callers wait on the
//!   slot guard and see the same result.
//! - A failed build leaves no entry behind.
//! - The sweeper only `try_lock`s slot guards, so a build in progress
//!   defers that pid to the next sweep.
//!
//! ## Module Structure
//!
//! - **`store`**: [`SymbolCacheStore`], the service object
//! - **`sweeper`**: periodic validation thread
//! - **`rebuild`**: off-hot-path rebuild workers

pub mod rebuild;
pub mod store;
pub mod sweeper;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ProbeSpec;
use crate::domain::{Pid, ProcessFingerprint, ResolutionError};
use crate::uprobe::SymbolUprobe;

pub use rebuild::RebuildWorkers;
pub use store::{CacheStats, SweepReport, SymbolCacheStore};
pub use sweeper::Sweeper;

/// Shared, immutable view of one process's resolved symbols
pub type CacheHandle = Arc<SymbolCache>;

/// A symbol that could not be resolved during a build
#[derive(Debug, Clone, Serialize)]
pub struct SymbolFailure {
    pub symbol: String,
    pub probe_function: String,
    #[serde(serialize_with = "serialize_error")]
    pub error: ResolutionError,
}

impl SymbolFailure {
    pub(crate) fn new(spec: &ProbeSpec, error: ResolutionError) -> Self {
        Self {
            symbol: spec.symbol.clone(),
            probe_function: spec.probe_function.clone(),
            error,
        }
    }
}

fn serialize_error<S: serde::Serializer>(error: &ResolutionError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Resolved symbols of one process instance
///
/// Immutable once published. Holds copies of the registered uprobes, never
/// the registry's own entries.
#[derive(Debug, Serialize)]
pub struct SymbolCache {
    pub pid: Pid,
    pub fingerprint: ProcessFingerprint,
    pub exe_path: PathBuf,
    pub uprobes: Vec<SymbolUprobe>,
    pub failures: Vec<SymbolFailure>,
    #[serde(skip)]
    pub built_at: Instant,
}

impl SymbolCache {
    /// First uprobe resolved for `symbol`
    pub fn uprobe(&self, symbol: &str) -> Option<&SymbolUprobe> {
        self.uprobes.iter().find(|u| u.name == symbol)
    }

    /// Uprobe whose function body contains `addr`
    pub fn symbolize(&self, addr: u64) -> Option<&SymbolUprobe> {
        self.uprobes.iter().find(|u| u.contains(addr))
    }

    /// Every configured symbol resolved
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
