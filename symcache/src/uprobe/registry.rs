//! Registry of resolved uprobes, grouped per tracing configuration

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::attach::{AttachReport, UprobeAttacher};
use super::{SymbolUprobe, UprobeKey, UprobeState};
use crate::domain::{Pid, RegistryError};

/// Owner of every [`SymbolUprobe`]
///
/// Entries are keyed by tracing configuration name; within a configuration
/// `(pid, binary_path, probe_function)` is unique. Readers receive clones.
#[derive(Debug, Default)]
pub struct UprobeRegistry {
    configs: RwLock<HashMap<String, Vec<SymbolUprobe>>>,
}

impl UprobeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking holder leaves the table structurally intact; keep serving it
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<SymbolUprobe>>> {
        self.configs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<SymbolUprobe>>> {
        self.configs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a resolved target under `config`
    pub fn add(&self, config: &str, uprobe: SymbolUprobe) -> Result<(), RegistryError> {
        let mut configs = self.write();
        let entries = configs.entry(config.to_string()).or_default();
        let key = uprobe.key();
        if entries.iter().any(|u| u.key() == key) {
            return Err(RegistryError::AlreadyRegistered {
                pid: key.pid,
                binary: key.binary_path.display().to_string(),
                probe: key.probe_function,
            });
        }
        debug!("Registered {uprobe} for {} under '{config}'", uprobe.pid);
        entries.push(uprobe);
        Ok(())
    }

    /// Remove every entry matching `pred` across all configurations
    fn remove_where(&self, pred: impl Fn(&SymbolUprobe) -> bool) -> Vec<SymbolUprobe> {
        let mut configs = self.write();
        let mut removed = Vec::new();
        for entries in configs.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(entries).into_iter().partition(&pred);
            *entries = kept;
            removed.extend(gone);
        }
        configs.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Remove all entries for `pid`, whichever process instance they belong to
    pub fn remove_for_pid(&self, pid: Pid) -> Vec<SymbolUprobe> {
        let removed = self.remove_where(|u| u.pid == pid);
        if !removed.is_empty() {
            debug!("Removed {} uprobes for {pid}", removed.len());
        }
        removed
    }

    /// Remove entries resolved for the process instance `(pid, start_time)`
    pub fn remove_for_process(&self, pid: Pid, start_time: u64) -> Vec<SymbolUprobe> {
        self.remove_where(|u| u.belongs_to(pid, start_time))
    }

    /// Remove entries for `pid` left over from an earlier process instance
    pub fn remove_stale(&self, pid: Pid, current_start_time: u64) -> Vec<SymbolUprobe> {
        let removed = self.remove_where(|u| u.pid == pid && u.process_start_time != current_start_time);
        if !removed.is_empty() {
            debug!("Dropped {} stale uprobes for recycled {pid}", removed.len());
        }
        removed
    }

    /// Drop a whole tracing configuration
    pub fn remove_config(&self, config: &str) -> Vec<SymbolUprobe> {
        self.write().remove(config).unwrap_or_default()
    }

    /// Independent copy of one entry
    pub fn copy(&self, config: &str, key: &UprobeKey) -> Result<SymbolUprobe, RegistryError> {
        self.read()
            .get(config)
            .and_then(|entries| entries.iter().find(|u| u.key() == *key))
            .cloned()
            .ok_or(RegistryError::NotRegistered)
    }

    /// Copies of every entry under `config`
    pub fn snapshot(&self, config: &str) -> Vec<SymbolUprobe> {
        self.read().get(config).cloned().unwrap_or_default()
    }

    /// Copies of every entry for `pid` across configurations
    pub fn for_pid(&self, pid: Pid) -> Vec<SymbolUprobe> {
        self.read().values().flatten().filter(|u| u.pid == pid).cloned().collect()
    }

    fn set_state(&self, config: &str, key: &UprobeKey, state: UprobeState) -> Result<(), RegistryError> {
        let mut configs = self.write();
        let uprobe = configs
            .get_mut(config)
            .and_then(|entries| entries.iter_mut().find(|u| u.key() == *key))
            .ok_or(RegistryError::NotRegistered)?;
        uprobe.transition(state)
    }

    /// Record that the attach layer installed the probe
    pub fn mark_attached(&self, config: &str, key: &UprobeKey) -> Result<(), RegistryError> {
        self.set_state(config, key, UprobeState::Attached)
    }

    pub fn mark_detached(&self, config: &str, key: &UprobeKey) -> Result<(), RegistryError> {
        self.set_state(config, key, UprobeState::Detached)
    }

    /// Hand every not-yet-attached entry of `config` to `attacher`
    ///
    /// The attacher runs without the registry lock held. Entries removed
    /// while it runs are skipped when recording the outcome.
    pub fn attach_pending(&self, config: &str, attacher: &mut dyn UprobeAttacher) -> AttachReport {
        let pending: Vec<SymbolUprobe> = self
            .snapshot(config)
            .into_iter()
            .filter(|u| !u.is_attached())
            .collect();

        let mut report = AttachReport::default();
        for uprobe in pending {
            let key = uprobe.key();
            match attacher.attach(&uprobe) {
                Ok(()) => match self.mark_attached(config, &key) {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => debug!("{uprobe} attached but no longer tracked: {e}"),
                },
                Err(e) => {
                    warn!("Failed to attach {uprobe}: {e:#}");
                    report.failed.push((key, format!("{e:#}")));
                }
            }
        }
        report
    }

    /// Detach every attached entry of `config`; entries stay registered
    pub fn detach_all(&self, config: &str, attacher: &mut dyn UprobeAttacher) -> AttachReport {
        let attached: Vec<SymbolUprobe> = self
            .snapshot(config)
            .into_iter()
            .filter(SymbolUprobe::is_attached)
            .collect();

        let mut report = AttachReport::default();
        for uprobe in attached {
            let key = uprobe.key();
            match attacher.detach(&uprobe) {
                Ok(()) => {
                    if self.mark_detached(config, &key).is_ok() {
                        report.succeeded += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to detach {uprobe}: {e:#}");
                    report.failed.push((key, format!("{e:#}")));
                }
            }
        }
        report
    }

    /// Total entries across configurations
    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
