//! The symbol cache service object

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Instant;

use super::{CacheHandle, SymbolCache, SymbolFailure};
use crate::config::{CacheConfig, ProbeSpec, ProbeTarget};
use crate::domain::{CacheError, Pid, ProcessFingerprint, ResolutionError, UprobeKind};
use crate::process::{find_library, ProcessInspector};
use crate::symbolization::SymbolResolver;
use crate::uprobe::{SymbolUprobe, UprobeRegistry};

/// A published cache together with the identity it was built for
#[derive(Debug)]
struct CacheEntry {
    fingerprint: ProcessFingerprint,
    cache: CacheHandle,
}

#[derive(Debug)]
enum SlotState {
    /// Nobody has built this pid yet; whoever locks it first builds
    Vacant,
    Ready(CacheEntry),
    /// Build failed; the slot is already out of the table
    Failed(CacheError),
    /// Evicted; the slot is already out of the table, callers retry
    Evicted,
}

#[derive(Debug)]
struct CacheSlot {
    state: Mutex<SlotState>,
}

impl CacheSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(SlotState::Vacant) })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // A panicked build leaves the slot Vacant or Ready, both consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Counters since construction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    evictions: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of one validation pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    /// Entries whose fingerprint was re-read
    pub checked: usize,
    pub evicted: usize,
    /// Entries skipped because a build held their guard
    pub deferred: usize,
    /// Uprobes dropped from the registry with the evicted entries; attached
    /// ones still need detaching
    pub removed: Vec<SymbolUprobe>,
}

/// Pid-keyed cache of resolved symbols
///
/// Construct once and share behind an `Arc`. Builds run on the calling
/// thread; see [`RebuildWorkers`](super::RebuildWorkers) to move them off a
/// latency-sensitive path.
pub struct SymbolCacheStore {
    config: CacheConfig,
    inspector: Arc<dyn ProcessInspector>,
    resolver: SymbolResolver,
    registry: Arc<UprobeRegistry>,
    probes: Vec<ProbeSpec>,
    table: Mutex<HashMap<Pid, Arc<CacheSlot>>>,
    /// Uprobes dropped while rebuilding for a recycled pid, until collected
    orphaned: Mutex<Vec<SymbolUprobe>>,
    stats: StatCounters,
}

impl SymbolCacheStore {
    /// `resolver` carries its own return-site policy; build it from
    /// `config.return_site_policy` to keep the two consistent.
    pub fn new(
        config: CacheConfig,
        inspector: Arc<dyn ProcessInspector>,
        resolver: SymbolResolver,
        registry: Arc<UprobeRegistry>,
        probes: Vec<ProbeSpec>,
    ) -> Self {
        Self {
            config,
            inspector,
            resolver,
            registry,
            probes,
            table: Mutex::new(HashMap::new()),
            orphaned: Mutex::new(Vec::new()),
            stats: StatCounters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<UprobeRegistry> {
        &self.registry
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Pid, Arc<CacheSlot>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Slot for `pid`, created Vacant if absent
    fn slot(&self, pid: Pid) -> Arc<CacheSlot> {
        Arc::clone(self.table().entry(pid).or_insert_with(CacheSlot::new))
    }

    /// Drop `slot` from the table unless it was already replaced
    fn remove_slot(&self, pid: Pid, slot: &Arc<CacheSlot>) {
        let mut table = self.table();
        if table.get(&pid).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            table.remove(&pid);
        }
    }

    fn is_fresh(&self, pid: Pid, fingerprint: &ProcessFingerprint) -> bool {
        self.inspector
            .fingerprint_of(pid)
            .is_some_and(|fresh| fresh.same_process(fingerprint))
    }

    /// Cache for `pid`, building it if missing or stale
    ///
    /// Concurrent callers for one pid share a single build and all observe
    /// its result.
    pub fn get_or_build(&self, pid: Pid) -> Result<CacheHandle, CacheError> {
        loop {
            let slot = self.slot(pid);
            let mut state = match slot.state.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    debug!("{}, waiting", CacheError::CacheBuildInProgress(pid));
                    slot.lock()
                }
            };

            match &*state {
                SlotState::Ready(entry) => {
                    if self.is_fresh(pid, &entry.fingerprint) {
                        return Ok(Arc::clone(&entry.cache));
                    }
                }
                SlotState::Failed(err) => return Err(err.clone()),
                SlotState::Evicted => continue,
                SlotState::Vacant => {}
            }

            let removed = self.retire(pid, &mut state, "fingerprint changed");
            self.orphan(removed);
            return self.build_locked(pid, &slot, &mut state);
        }
    }

    /// Like [`get_or_build`](Self::get_or_build) but never waits for
    /// another caller's build
    pub fn try_get(&self, pid: Pid) -> Result<CacheHandle, CacheError> {
        let slot = self.table().get(&pid).cloned();
        if slot.as_ref().is_some_and(|slot| matches!(slot.state.try_lock(), Err(TryLockError::WouldBlock))) {
            return Err(CacheError::CacheBuildInProgress(pid));
        }
        self.get_or_build(pid)
    }

    /// Published cache for `pid` without validation, building or waiting
    pub fn lookup(&self, pid: Pid) -> Option<CacheHandle> {
        let slot = self.table().get(&pid).cloned()?;
        let state = match slot.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        match &*state {
            SlotState::Ready(entry) => Some(Arc::clone(&entry.cache)),
            _ => None,
        }
    }

    /// Evict `pid`
    ///
    /// Returns the uprobes removed with it when a published cache was
    /// dropped, `None` when there was nothing to evict.
    pub fn invalidate(&self, pid: Pid) -> Option<Vec<SymbolUprobe>> {
        let slot = self.table().get(&pid).cloned()?;
        let mut state = slot.lock();
        let was_ready = matches!(*state, SlotState::Ready(_));
        let removed = self.evict_locked(pid, &slot, &mut state, "invalidated");
        was_ready.then_some(removed)
    }

    /// The process behind `pid` exited: drop its cache and every uprobe
    /// registered for it, returning the removed uprobes
    pub fn process_exited(&self, pid: Pid) -> Vec<SymbolUprobe> {
        let mut removed = self.invalidate(pid).unwrap_or_default();
        removed.extend(self.registry.remove_for_pid(pid));
        removed
    }

    /// Uprobes dropped by builds that replaced a recycled pid's entry
    ///
    /// Each uprobe is returned once; attached ones still need detaching.
    pub fn take_orphaned(&self) -> Vec<SymbolUprobe> {
        std::mem::take(&mut *self.orphaned.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn orphan(&self, removed: Vec<SymbolUprobe>) {
        if !removed.is_empty() {
            self.orphaned.lock().unwrap_or_else(|e| e.into_inner()).extend(removed);
        }
    }

    /// Re-validate every published entry against live process state
    pub fn sweep(&self) -> SweepReport {
        let slots: Vec<(Pid, Arc<CacheSlot>)> = self
            .table()
            .iter()
            .map(|(pid, slot)| (*pid, Arc::clone(slot)))
            .collect();

        let mut report = SweepReport::default();
        for (pid, slot) in slots {
            let mut state = match slot.state.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    report.deferred += 1;
                    continue;
                }
            };

            let stale = match &*state {
                SlotState::Ready(entry) => {
                    report.checked += 1;
                    !self.is_fresh(pid, &entry.fingerprint)
                }
                _ => false,
            };
            if stale {
                let removed = self.evict_locked(pid, &slot, &mut state, "process gone or recycled");
                report.removed.extend(removed);
                report.evicted += 1;
            }
        }

        if report.evicted > 0 || report.deferred > 0 {
            debug!(
                "Sweep: {} checked, {} evicted, {} deferred, {} uprobes removed",
                report.checked,
                report.evicted,
                report.deferred,
                report.removed.len()
            );
        }
        report
    }

    /// Number of pids with a slot, including builds in progress
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            builds_started: self.stats.builds_started.load(Ordering::Relaxed),
            builds_succeeded: self.stats.builds_succeeded.load(Ordering::Relaxed),
            builds_failed: self.stats.builds_failed.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Drop a Ready entry's cache and the uprobes of its process instance,
    /// leaving the slot Vacant. Caller holds the slot guard.
    fn retire(&self, pid: Pid, state: &mut SlotState, reason: &str) -> Vec<SymbolUprobe> {
        let SlotState::Ready(entry) = std::mem::replace(state, SlotState::Vacant) else {
            return Vec::new();
        };
        let removed = self
            .registry
            .remove_for_process(pid, entry.fingerprint.start_time_ms);
        StatCounters::bump(&self.stats.evictions);
        info!(
            "Evicted symbol cache for {pid} ({}, started {}): {reason}, {} uprobes removed",
            entry.fingerprint.comm,
            entry.fingerprint.start_time_ms,
            removed.len()
        );
        removed
    }

    fn evict_locked(
        &self,
        pid: Pid,
        slot: &Arc<CacheSlot>,
        state: &mut SlotState,
        reason: &str,
    ) -> Vec<SymbolUprobe> {
        let removed = self.retire(pid, state, reason);
        *state = SlotState::Evicted;
        self.remove_slot(pid, slot);
        removed
    }

    /// Build into `state` while holding its guard; publishes on success,
    /// removes the slot on failure
    fn build_locked(
        &self,
        pid: Pid,
        slot: &Arc<CacheSlot>,
        state: &mut SlotState,
    ) -> Result<CacheHandle, CacheError> {
        StatCounters::bump(&self.stats.builds_started);
        let started = Instant::now();

        match self.build(pid) {
            Ok((fingerprint, cache)) => {
                StatCounters::bump(&self.stats.builds_succeeded);
                info!(
                    "Built symbol cache for {pid} ({}): {} uprobes, {} failed symbols in {:?}",
                    fingerprint.comm,
                    cache.uprobes.len(),
                    cache.failures.len(),
                    started.elapsed()
                );
                *state = SlotState::Ready(CacheEntry { fingerprint, cache: Arc::clone(&cache) });
                Ok(cache)
            }
            Err(e) => {
                StatCounters::bump(&self.stats.builds_failed);
                warn!("Symbol cache for {pid} not built: {e}");
                *state = SlotState::Failed(e.clone());
                self.remove_slot(pid, slot);
                Err(e)
            }
        }
    }

    fn build(&self, pid: Pid) -> Result<(ProcessFingerprint, CacheHandle), CacheError> {
        let fingerprint = self.inspector.fingerprint_of(pid).ok_or(CacheError::NotFound(pid))?;

        // Uprobes of an earlier holder of this pid go before new ones arrive
        self.orphan(self.registry.remove_stale(pid, fingerprint.start_time_ms));

        let exe_path = self.inspector.exe_path(pid).ok_or(CacheError::NotFound(pid))?;

        // Reading the executable decides whether Go specs apply at all
        let is_go = self
            .resolver
            .version(&exe_path, UprobeKind::GoRuntime)
            .map_err(|e| {
                debug!("Executable of {pid} unreadable: {e}");
                CacheError::BinaryUnreadable { path: exe_path.clone() }
            })?
            .is_some();

        let mapped = if self.probes.iter().any(|p| matches!(p.target, ProbeTarget::Library(_))) {
            self.inspector.mapped_paths(pid)
        } else {
            Vec::new()
        };

        let mut uprobes: Vec<SymbolUprobe> = Vec::new();
        let mut failures = Vec::new();
        for spec in &self.probes {
            let binary: PathBuf = match &spec.target {
                ProbeTarget::Executable if spec.kind == UprobeKind::GoRuntime && !is_go => continue,
                ProbeTarget::Executable => exe_path.clone(),
                ProbeTarget::Library(prefix) => match find_library(&mapped, prefix) {
                    Some(path) => path.clone(),
                    None => {
                        let error = ResolutionError::LibraryNotMapped { library: prefix.clone() };
                        debug!("{spec} skipped for {pid}: {error}");
                        failures.push(SymbolFailure::new(spec, error));
                        continue;
                    }
                },
            };

            match self.resolver.resolve_uprobe(pid, &fingerprint, &binary, spec) {
                Ok(uprobe) => uprobes.push(uprobe),
                Err(error) if error.is_fatal_to_build() && binary == exe_path => {
                    return Err(CacheError::BinaryUnreadable { path: exe_path });
                }
                Err(error) => {
                    debug!("{spec} failed for {pid}: {error}");
                    failures.push(SymbolFailure::new(spec, error));
                }
            }
        }

        for uprobe in &uprobes {
            if let Err(e) = self.registry.add(&self.config.tracing_config, uprobe.clone()) {
                debug!("{e}");
            }
        }

        let cache = Arc::new(SymbolCache {
            pid,
            fingerprint: fingerprint.clone(),
            exe_path,
            uprobes,
            failures,
            built_at: Instant::now(),
        });
        Ok((fingerprint, cache))
    }
}
