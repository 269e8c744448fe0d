//! # Uprobe Symbol Registry
//!
//! Resolved instrumentation targets ([`SymbolUprobe`]) and the registry that
//! owns them, grouped per tracing configuration.
//!
//! ## Lifecycle
//!
//! ```text
//! Resolved ──attach ok──▶ Attached ──detach──▶ Detached
//!    │                                            │
//!    └──────────── removed from the registry ◀────┘
//! ```
//!
//! An entry only becomes `Attached` after the [`UprobeAttacher`] reports
//! success. Callers outside the registry only ever see copies.

pub mod attach;
pub mod registry;

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use symcache_common::{
    UprobeAttachTarget, FUNC_RET_MAX, TARGET_FLAG_GO_RUNTIME, TARGET_FLAG_OPENSSL,
    TARGET_FLAG_RETURN_PROBE,
};

use crate::config::ProbeSpec;
use crate::domain::{Pid, RegistryError, UprobeKind, VersionInfo};

pub use attach::{AttachReport, UprobeAttacher};
pub use registry::UprobeRegistry;

/// Return-site addresses of one function, never more than [`FUNC_RET_MAX`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ReturnSites(Vec<u64>);

impl ReturnSites {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Accept `addresses` if they fit; hand them back otherwise
    pub fn try_from_vec(addresses: Vec<u64>) -> Result<Self, Vec<u64>> {
        if addresses.len() > FUNC_RET_MAX {
            return Err(addresses);
        }
        Ok(Self(addresses))
    }

    /// Keep only the first [`FUNC_RET_MAX`] addresses
    pub fn truncated(mut addresses: Vec<u64>) -> Self {
        addresses.truncate(FUNC_RET_MAX);
        Self(addresses)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UprobeState {
    Resolved,
    Attached,
    Detached,
}

impl UprobeState {
    fn name(self) -> &'static str {
        match self {
            UprobeState::Resolved => "resolved",
            UprobeState::Attached => "attached",
            UprobeState::Detached => "detached",
        }
    }
}

impl fmt::Display for UprobeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a registry entry; unique within one tracing configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UprobeKey {
    pub pid: Pid,
    pub binary_path: PathBuf,
    pub probe_function: String,
}

/// One resolved instrumentation target
#[derive(Debug, Clone, Serialize)]
pub struct SymbolUprobe {
    pub kind: UprobeKind,
    pub pid: Pid,
    /// Start time (ms) of the process this was resolved for
    pub process_start_time: u64,
    /// Symbol name in the binary
    pub name: String,
    pub binary_path: PathBuf,
    /// Kernel program the target is attached to
    pub probe_function: String,
    pub entry_address: u64,
    pub size: u64,
    pub version: VersionInfo,
    return_addresses: ReturnSites,
    pub is_return_probe: bool,
    state: UprobeState,
}

impl SymbolUprobe {
    /// A freshly resolved, not yet attached target
    ///
    /// `return_addresses` is dropped unless `spec` asks for return probes.
    #[allow(clippy::too_many_arguments)]
    pub fn resolved(
        spec: &ProbeSpec,
        pid: Pid,
        process_start_time: u64,
        binary_path: PathBuf,
        entry_address: u64,
        size: u64,
        version: VersionInfo,
        return_addresses: ReturnSites,
    ) -> Self {
        let return_addresses = if spec.is_return_probe { return_addresses } else { ReturnSites::new() };
        Self {
            kind: spec.kind,
            pid,
            process_start_time,
            name: spec.symbol.clone(),
            binary_path,
            probe_function: spec.probe_function.clone(),
            entry_address,
            size,
            version,
            return_addresses,
            is_return_probe: spec.is_return_probe,
            state: UprobeState::Resolved,
        }
    }

    pub fn key(&self) -> UprobeKey {
        UprobeKey {
            pid: self.pid,
            binary_path: self.binary_path.clone(),
            probe_function: self.probe_function.clone(),
        }
    }

    pub fn return_addresses(&self) -> &[u64] {
        self.return_addresses.as_slice()
    }

    pub fn state(&self) -> UprobeState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.state == UprobeState::Attached
    }

    /// Whether `addr` falls inside `[entry_address, entry_address + size)`
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.entry_address && addr < self.entry_address.saturating_add(self.size)
    }

    /// Whether this entry belongs to the process identified by `pid` and `start_time`
    pub fn belongs_to(&self, pid: Pid, start_time: u64) -> bool {
        self.pid == pid && self.process_start_time == start_time
    }

    pub(crate) fn transition(&mut self, to: UprobeState) -> Result<(), RegistryError> {
        let allowed = matches!(
            (self.state, to),
            (UprobeState::Resolved | UprobeState::Detached, UprobeState::Attached)
                | (UprobeState::Attached, UprobeState::Detached)
        );
        if !allowed {
            return Err(RegistryError::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Flatten into the record shared with kernel-side programs
    pub fn to_attach_target(&self) -> UprobeAttachTarget {
        let mut flags = 0;
        if self.is_return_probe {
            flags |= TARGET_FLAG_RETURN_PROBE;
        }
        match self.kind {
            UprobeKind::GoRuntime => flags |= TARGET_FLAG_GO_RUNTIME,
            UprobeKind::OpenSsl => flags |= TARGET_FLAG_OPENSSL,
            UprobeKind::Other => {}
        }

        let mut target = UprobeAttachTarget {
            pid: self.pid.0,
            flags,
            process_start_time: self.process_start_time,
            entry_address: self.entry_address,
            size: self.size,
            ..UprobeAttachTarget::default()
        };
        let sites = self.return_addresses();
        target.return_addresses[..sites.len()].copy_from_slice(sites);
        #[allow(clippy::cast_possible_truncation)]
        {
            target.return_count = sites.len() as u32;
        }
        target
    }
}

impl fmt::Display for SymbolUprobe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ 0x{:x} ({}, {})",
            self.kind, self.name, self.entry_address, self.probe_function, self.state
        )
    }
}
