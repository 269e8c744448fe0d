//! Boundary to the kernel instrumentation layer

use anyhow::Result;
use serde::Serialize;

use super::{SymbolUprobe, UprobeKey};

/// Installs and removes kernel probes for resolved targets
///
/// Implementations receive registry copies; they never see registry-owned
/// entries and cannot change their state directly.
pub trait UprobeAttacher {
    fn attach(&mut self, uprobe: &SymbolUprobe) -> Result<()>;
    fn detach(&mut self, uprobe: &SymbolUprobe) -> Result<()>;
}

/// Outcome of one attach or detach pass over a tracing configuration
#[derive(Debug, Default, Serialize)]
pub struct AttachReport {
    pub succeeded: usize,
    /// Targets the attacher refused, with its reason
    #[serde(skip)]
    pub failed: Vec<(UprobeKey, String)>,
}

impl AttachReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
