//! Cache store behaviour against an in-memory process table and binaries

use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use symcache::cache::{RebuildWorkers, Sweeper, SymbolCacheStore};
use symcache::config::{builtin_probes, CacheConfig, ProbeSpec, ReturnSitePolicy};
use symcache::domain::{CacheError, Pid, ProcessFingerprint, ResolutionError, UprobeKind, VersionInfo};
use symcache::process::ProcessInspector;
use symcache::symbolization::{
    BinaryAnalyzer, CodeArch, ElfAnalyzer, FunctionCode, SymbolLocation, SymbolResolver,
};
use symcache::uprobe::UprobeRegistry;

// ============================================================================
// Fake collaborators
// ============================================================================

#[derive(Clone)]
struct FakeProcess {
    fingerprint: ProcessFingerprint,
    exe: PathBuf,
    mapped: Vec<PathBuf>,
}

#[derive(Default)]
struct FakeInspector {
    processes: Mutex<HashMap<Pid, FakeProcess>>,
}

impl FakeInspector {
    fn spawn(&self, pid: u32, start: u64, comm: &str, exe: &str, mapped: &[&str]) {
        self.spawn_in(pid, start, 5, comm, exe, mapped);
    }

    fn spawn_in(&self, pid: u32, start: u64, netns: u64, comm: &str, exe: &str, mapped: &[&str]) {
        self.processes.lock().unwrap().insert(
            Pid(pid),
            FakeProcess {
                fingerprint: ProcessFingerprint::new(start, netns, comm),
                exe: PathBuf::from(exe),
                mapped: mapped.iter().map(PathBuf::from).collect(),
            },
        );
    }

    fn kill(&self, pid: u32) {
        self.processes.lock().unwrap().remove(&Pid(pid));
    }

    fn get(&self, pid: Pid) -> Option<FakeProcess> {
        self.processes.lock().unwrap().get(&pid).cloned()
    }
}

impl ProcessInspector for FakeInspector {
    fn fingerprint_of(&self, pid: Pid) -> Option<ProcessFingerprint> {
        self.get(pid).map(|p| p.fingerprint)
    }

    fn exe_path(&self, pid: Pid) -> Option<PathBuf> {
        self.get(pid).map(|p| p.exe)
    }

    fn mapped_paths(&self, pid: Pid) -> Vec<PathBuf> {
        self.get(pid).map(|p| p.mapped).unwrap_or_default()
    }
}

struct FakeFunction {
    location: SymbolLocation,
    /// Offsets of `ret` inside an otherwise NOP body
    rets: Vec<u64>,
}

/// Blocks resolution of one symbol until released or the release sender
/// is dropped
struct Gate {
    symbol: &'static str,
    entered: Sender<()>,
    release: Receiver<()>,
}

#[derive(Default)]
struct FakeAnalyzer {
    binaries: Mutex<HashMap<PathBuf, HashMap<String, FakeFunction>>>,
    lookups: AtomicUsize,
    gate: Option<Gate>,
    /// Symbol whose next lookup panics
    panic_once: Mutex<Option<&'static str>>,
}

impl FakeAnalyzer {
    fn forget_binaries(&self) {
        self.binaries.lock().unwrap().clear();
    }

    fn add(&self, binary: &str, symbol: &str, offset: u64, size: u64, rets: &[u64]) {
        self.binaries.lock().unwrap().entry(PathBuf::from(binary)).or_default().insert(
            symbol.to_string(),
            FakeFunction { location: SymbolLocation { offset, size }, rets: rets.to_vec() },
        );
    }
}

impl BinaryAnalyzer for FakeAnalyzer {
    fn symbol_offset(&self, binary: &Path, name: &str) -> Result<Option<SymbolLocation>, ResolutionError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if gate.symbol == name {
                let _ = gate.entered.try_send(());
                let _ = gate.release.recv();
            }
        }
        {
            let mut panic_once = self.panic_once.lock().unwrap();
            if *panic_once == Some(name) {
                *panic_once = None;
                drop(panic_once);
                panic!("corrupt symbol table in {}", binary.display());
            }
        }
        let binaries = self.binaries.lock().unwrap();
        let symbols = binaries
            .get(binary)
            .ok_or_else(|| ResolutionError::BinaryUnreadable { path: binary.to_path_buf() })?;
        Ok(symbols.get(name).map(|f| f.location))
    }

    fn load_bias(&self, _pid: Pid, _binary: &Path) -> u64 {
        0
    }

    fn function_code(&self, binary: &Path, location: SymbolLocation) -> Result<FunctionCode, ResolutionError> {
        let binaries = self.binaries.lock().unwrap();
        let function = binaries[binary].values().find(|f| f.location == location).unwrap();
        let mut bytes = vec![0x90; location.size as usize];
        for &off in &function.rets {
            bytes[off as usize] = 0xc3;
        }
        Ok(FunctionCode { arch: CodeArch::X86_64, bytes })
    }

    fn version(&self, binary: &Path, kind: UprobeKind) -> Result<Option<VersionInfo>, ResolutionError> {
        match kind {
            UprobeKind::GoRuntime => {
                if !self.binaries.lock().unwrap().contains_key(binary) {
                    return Err(ResolutionError::BinaryUnreadable { path: binary.to_path_buf() });
                }
                Ok(binary.ends_with("gosrv").then(|| VersionInfo::new(1, 21, 5)))
            }
            UprobeKind::OpenSsl => Ok(binary
                .file_name()
                .and_then(|f| f.to_str())
                .and_then(VersionInfo::parse_openssl_soname)),
            UprobeKind::Other => Ok(None),
        }
    }
}

struct Harness {
    inspector: Arc<FakeInspector>,
    analyzer: Arc<FakeAnalyzer>,
    registry: Arc<UprobeRegistry>,
    store: Arc<SymbolCacheStore>,
}

fn harness_with(analyzer: FakeAnalyzer, probes: Vec<ProbeSpec>, policy: ReturnSitePolicy) -> Harness {
    let inspector = Arc::new(FakeInspector::default());
    let analyzer = Arc::new(analyzer);
    let registry = Arc::new(UprobeRegistry::new());
    let config = CacheConfig { return_site_policy: policy, ..CacheConfig::default() };
    let resolver = SymbolResolver::new(analyzer.clone(), policy);
    let store = Arc::new(SymbolCacheStore::new(
        config,
        inspector.clone(),
        resolver,
        registry.clone(),
        probes,
    ));
    Harness { inspector, analyzer, registry, store }
}

fn harness(probes: &[&str]) -> Harness {
    let probes = probes.iter().map(|p| p.parse().unwrap()).collect();
    harness_with(FakeAnalyzer::default(), probes, ReturnSitePolicy::Reject)
}

// ============================================================================
// Build and identity
// ============================================================================

#[test]
fn test_concurrent_callers_share_one_build() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(7, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&h.store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.get_or_build(Pid(7)).unwrap()
            })
        })
        .collect();
    let caches: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    for cache in &caches[1..] {
        assert!(Arc::ptr_eq(&caches[0], cache));
    }
    assert_eq!(h.store.stats().builds_started, 1);
    assert_eq!(h.analyzer.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(h.registry.len(), 1);
}

#[test]
fn test_pid_reuse_rebuilds_without_stale_addresses() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(100, 1000, "app", "/app/v1", &[]);
    h.analyzer.add("/app/v1", "handleConn", 0x401000, 0x80, &[]);
    h.analyzer.add("/app/v2", "handleConn", 0x402000, 0x80, &[]);

    let first = h.store.get_or_build(Pid(100)).unwrap();
    assert_eq!(first.uprobe("handleConn").unwrap().entry_address, 0x401000);

    // Process exits, pid 100 is recycled
    h.inspector.kill(100);
    h.inspector.spawn(100, 2000, "app2", "/app/v2", &[]);

    let second = h.store.get_or_build(Pid(100)).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.fingerprint.start_time_ms, 2000);
    assert_eq!(second.fingerprint.comm.as_str(), "app2");
    assert_eq!(second.uprobe("handleConn").unwrap().entry_address, 0x402000);
    assert!(second.symbolize(0x401010).is_none());

    let registered = h.registry.for_pid(Pid(100));
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].process_start_time, 2000);
    assert_eq!(registered[0].entry_address, 0x402000);
    assert_eq!(h.store.stats().evictions, 1);

    let orphaned = h.store.take_orphaned();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].process_start_time, 1000);
    assert_eq!(orphaned[0].entry_address, 0x401000);
    assert!(h.store.take_orphaned().is_empty());
}

#[test]
fn test_netns_change_alone_rebuilds() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn_in(6, 1000, 5, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    let first = h.store.get_or_build(Pid(6)).unwrap();

    // Same pid and start time, seen from another network namespace
    h.inspector.spawn_in(6, 1000, 9, "app", "/app/server", &[]);
    let second = h.store.get_or_build(Pid(6)).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.fingerprint.netns_id, 9);
    assert_eq!(h.store.stats().builds_started, 2);
    assert_eq!(h.store.stats().evictions, 1);
    assert_eq!(h.registry.for_pid(Pid(6)).len(), 1);
}

#[test]
fn test_comm_change_alone_keeps_cache() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(5, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);

    let first = h.store.get_or_build(Pid(5)).unwrap();
    // prctl(PR_SET_NAME) renames without changing identity
    h.inspector.spawn(5, 1000, "renamed", "/app/server", &[]);
    let second = h.store.get_or_build(Pid(5)).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.store.stats().builds_started, 1);
}

#[test]
fn test_openssl_return_sites() {
    let h = harness(&["openssl:SSL_write:ret"]);
    h.inspector.spawn(9, 1000, "curl", "/usr/bin/curl", &["/usr/bin/curl", "/usr/lib/libssl.so.3"]);
    h.analyzer.add("/usr/bin/curl", "main", 0x1000, 0x10, &[]);
    h.analyzer.add("/usr/lib/libssl.so.3", "SSL_write", 0x7000, 0x200, &[0x20, 0x90, 0x1b0]);

    let cache = h.store.get_or_build(Pid(9)).unwrap();
    let uprobe = cache.uprobe("SSL_write").unwrap();

    assert!(uprobe.is_return_probe);
    assert_eq!(uprobe.return_addresses(), &[0x7020, 0x7090, 0x71b0]);
    assert_eq!(uprobe.binary_path, PathBuf::from("/usr/lib/libssl.so.3"));
    assert_eq!(uprobe.version, VersionInfo::new(3, 0, 0));
    assert_eq!(uprobe.probe_function, "uretprobe_ssl_write");
}

#[test]
fn test_missing_symbol_is_partial_failure() {
    let h = harness(&["other:handleConn", "other:doesNotExist"]);
    h.inspector.spawn(11, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);

    let cache = h.store.get_or_build(Pid(11)).unwrap();
    assert!(!cache.is_complete());
    assert!(cache.uprobe("doesNotExist").is_none());
    assert_eq!(cache.failures.len(), 1);
    assert_eq!(
        cache.failures[0].error,
        ResolutionError::ResolutionFailed { symbol: "doesNotExist".into() }
    );

    let registered = h.registry.for_pid(Pid(11));
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].name, "handleConn");
}

#[test]
fn test_too_many_return_sites_reported() {
    let rets: Vec<u64> = (0..40).map(|i| i * 4).collect();

    let h = harness(&["other:dispatch:ret"]);
    h.inspector.spawn(12, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "dispatch", 0x5000, 0x100, &rets);

    let cache = h.store.get_or_build(Pid(12)).unwrap();
    assert!(cache.uprobe("dispatch").is_none());
    assert_eq!(
        cache.failures[0].error,
        ResolutionError::TooManyReturnSites { symbol: "dispatch".into(), found: 40 }
    );
    assert!(h.registry.is_empty());

    let analyzer = FakeAnalyzer::default();
    analyzer.add("/app/server", "dispatch", 0x5000, 0x100, &rets);
    let h = harness_with(analyzer, vec!["other:dispatch:ret".parse().unwrap()], ReturnSitePolicy::Truncate);
    h.inspector.spawn(12, 1000, "app", "/app/server", &[]);

    let cache = h.store.get_or_build(Pid(12)).unwrap();
    assert_eq!(cache.uprobe("dispatch").unwrap().return_addresses().len(), 32);
}

#[test]
fn test_go_and_library_probes_only_where_they_apply() {
    let h = harness_with(FakeAnalyzer::default(), builtin_probes(), ReturnSitePolicy::Reject);
    h.inspector.spawn(20, 1000, "gosrv", "/srv/gosrv", &["/srv/gosrv"]);
    h.analyzer.add("/srv/gosrv", "runtime.casgstatus", 0x43_0000, 0x40, &[]);
    h.analyzer.add("/srv/gosrv", "runtime.newproc1", 0x43_1000, 0x40, &[0x3f]);
    h.analyzer.add("/srv/gosrv", "crypto/tls.(*Conn).Write", 0x60_0000, 0x40, &[]);
    h.analyzer.add("/srv/gosrv", "crypto/tls.(*Conn).Read", 0x60_1000, 0x40, &[0x10, 0x3f]);

    h.inspector.spawn(21, 1000, "cserver", "/srv/cserver", &["/srv/cserver"]);
    h.analyzer.add("/srv/cserver", "main", 0x1000, 0x10, &[]);

    let go = h.store.get_or_build(Pid(20)).unwrap();
    assert_eq!(go.uprobes.len(), 5);
    assert!(go.uprobes.iter().all(|u| u.kind == UprobeKind::GoRuntime));
    assert_eq!(go.uprobes[0].version, VersionInfo::new(1, 21, 5));
    // libssl not mapped
    assert_eq!(go.failures.len(), 4);
    assert!(go
        .failures
        .iter()
        .all(|f| matches!(f.error, ResolutionError::LibraryNotMapped { .. })));

    // Not a Go binary: Go probes are not attempted at all
    let c = h.store.get_or_build(Pid(21)).unwrap();
    assert!(c.uprobes.is_empty());
    assert!(c.failures.iter().all(|f| !f.probe_function.contains("casgstatus")));
}

#[test]
fn test_deleted_go_executable_fails_build() {
    let inspector = Arc::new(FakeInspector::default());
    let registry = Arc::new(UprobeRegistry::new());
    let resolver = SymbolResolver::new(Arc::new(ElfAnalyzer::new()), ReturnSitePolicy::Reject);
    let store = SymbolCacheStore::new(
        CacheConfig::default(),
        inspector.clone(),
        resolver,
        registry.clone(),
        builtin_probes(),
    );
    // Binary replaced on disk after the process started, libssl not mapped
    inspector.spawn(22, 1000, "gosrv", "/usr/local/bin/gosrv (deleted)", &[]);

    let unreadable = CacheError::BinaryUnreadable { path: PathBuf::from("/usr/local/bin/gosrv (deleted)") };
    assert_eq!(store.get_or_build(Pid(22)).unwrap_err(), unreadable);
    assert!(store.is_empty());
    assert!(registry.is_empty());

    // Not cached: the next call builds again
    assert_eq!(store.get_or_build(Pid(22)).unwrap_err(), unreadable);
    assert_eq!(store.stats().builds_started, 2);
    assert_eq!(store.stats().builds_failed, 2);
    assert_eq!(store.stats().builds_succeeded, 0);
}

// ============================================================================
// Failure rollback
// ============================================================================

#[test]
fn test_vanished_process_leaves_no_entry() {
    let h = harness(&["other:handleConn"]);
    assert_eq!(h.store.get_or_build(Pid(404)).unwrap_err(), CacheError::NotFound(Pid(404)));
    assert!(h.store.is_empty());
    assert_eq!(h.store.stats().builds_failed, 1);
}

#[test]
fn test_unreadable_binary_rolls_back_then_retries() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(13, 1000, "app", "/app/server", &[]);

    let err = h.store.get_or_build(Pid(13)).unwrap_err();
    assert_eq!(err, CacheError::BinaryUnreadable { path: PathBuf::from("/app/server") });
    assert!(h.store.is_empty());
    assert!(h.registry.is_empty());

    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    let cache = h.store.get_or_build(Pid(13)).unwrap();
    assert_eq!(cache.uprobes.len(), 1);
    assert_eq!(h.store.len(), 1);
}

#[test]
fn test_waiters_share_one_failure() {
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let analyzer = FakeAnalyzer {
        gate: Some(Gate { symbol: "slow", entered: entered_tx, release: release_rx }),
        ..FakeAnalyzer::default()
    };
    analyzer.add("/app/server", "slow", 0x1000, 0x10, &[]);
    let h = harness_with(analyzer, vec!["other:slow".parse().unwrap()], ReturnSitePolicy::Reject);
    h.inspector.spawn(14, 1000, "app", "/app/server", &[]);

    let store = Arc::clone(&h.store);
    let builder = thread::spawn(move || store.get_or_build(Pid(14)));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let waiters: Vec<_> = (0..7)
        .map(|_| {
            let store = Arc::clone(&h.store);
            thread::spawn(move || store.get_or_build(Pid(14)))
        })
        .collect();
    // Let the waiters block on the slot guard, then fail the build
    thread::sleep(Duration::from_millis(200));
    h.analyzer.forget_binaries();
    drop(release_tx);

    let unreadable = CacheError::BinaryUnreadable { path: PathBuf::from("/app/server") };
    assert_eq!(builder.join().unwrap().unwrap_err(), unreadable);
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap_err(), unreadable);
    }
    assert_eq!(h.store.stats().builds_started, 1);
    assert_eq!(h.store.stats().builds_failed, 1);
    assert!(h.store.is_empty());
    assert!(h.registry.is_empty());
}

// ============================================================================
// Invalidation and sweeping
// ============================================================================

#[test]
fn test_sweep_evicts_vanished_process() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(1, 1000, "a", "/app/server", &[]);
    h.inspector.spawn(2, 1000, "b", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    h.store.get_or_build(Pid(1)).unwrap();
    h.store.get_or_build(Pid(2)).unwrap();

    h.inspector.kill(2);
    let report = h.store.sweep();

    assert_eq!(report.checked, 2);
    assert_eq!(report.evicted, 1);
    assert_eq!(report.deferred, 0);
    assert!(h.store.lookup(Pid(1)).is_some());
    assert!(h.store.lookup(Pid(2)).is_none());
    assert!(h.registry.for_pid(Pid(2)).is_empty());
    assert_eq!(h.registry.for_pid(Pid(1)).len(), 1);
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].pid, Pid(2));
}

#[test]
fn test_sweep_evicts_recycled_pid() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(8, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    let first = h.store.get_or_build(Pid(8)).unwrap();

    let config = h.store.config().tracing_config.clone();
    let key = first.uprobe("handleConn").unwrap().key();
    h.registry.mark_attached(&config, &key).unwrap();

    // Live process under the same pid, started later
    h.inspector.spawn(8, 2000, "app", "/app/server", &[]);
    let report = h.store.sweep();

    assert_eq!(report.checked, 1);
    assert_eq!(report.evicted, 1);
    assert!(h.store.lookup(Pid(8)).is_none());
    assert!(h.registry.for_pid(Pid(8)).is_empty());
    // Still attached in the kernel; the caller owns the detach
    assert_eq!(report.removed.len(), 1);
    assert!(report.removed[0].is_attached());
    assert_eq!(report.removed[0].process_start_time, 1000);

    let second = h.store.get_or_build(Pid(8)).unwrap();
    assert_eq!(second.fingerprint.start_time_ms, 2000);
    assert_eq!(h.store.stats().builds_started, 2);
}

#[test]
fn test_invalidate_is_idempotent() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(3, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    h.store.get_or_build(Pid(3)).unwrap();

    let removed = h.store.invalidate(Pid(3)).unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name, "handleConn");
    assert!(h.store.invalidate(Pid(3)).is_none());
    assert!(h.store.is_empty());
    assert!(h.registry.is_empty());
}

#[test]
fn test_process_exited_clears_registry() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(4, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    h.store.get_or_build(Pid(4)).unwrap();

    let removed = h.store.process_exited(Pid(4));
    assert_eq!(removed.len(), 1);
    assert!(h.store.lookup(Pid(4)).is_none());
    assert!(h.registry.for_pid(Pid(4)).is_empty());
}

#[test]
fn test_sweep_defers_entry_being_built() {
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let analyzer = FakeAnalyzer {
        gate: Some(Gate { symbol: "slow", entered: entered_tx, release: release_rx }),
        ..FakeAnalyzer::default()
    };
    analyzer.add("/app/server", "slow", 0x1000, 0x10, &[]);
    let h = harness_with(analyzer, vec!["other:slow".parse().unwrap()], ReturnSitePolicy::Reject);
    h.inspector.spawn(30, 1000, "app", "/app/server", &[]);

    let store = Arc::clone(&h.store);
    let builder = thread::spawn(move || store.get_or_build(Pid(30)));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Build in progress: nothing may observe or evict a half-built entry
    assert_eq!(h.store.sweep().deferred, 1);
    assert!(h.store.lookup(Pid(30)).is_none());
    assert_eq!(h.store.try_get(Pid(30)).unwrap_err(), CacheError::CacheBuildInProgress(Pid(30)));

    release_tx.send(()).unwrap();
    let cache = builder.join().unwrap().unwrap();
    assert_eq!(cache.uprobes.len(), 1);
    assert!(Arc::ptr_eq(&h.store.lookup(Pid(30)).unwrap(), &cache));
}

// ============================================================================
// Rebuild workers
// ============================================================================

#[test]
fn test_rebuild_workers_populate_cache() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(40, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);

    let mut workers = RebuildWorkers::from_config(Arc::clone(&h.store)).unwrap();
    assert!(workers.lookup(Pid(40)).is_none());

    // Shutdown drains the queue
    workers.shutdown();
    assert!(h.store.lookup(Pid(40)).is_some());
    assert_eq!(h.store.stats().builds_started, 1);
    assert!(!workers.request(Pid(40)));
}

#[test]
fn test_rebuild_worker_survives_panicking_build() {
    let analyzer = FakeAnalyzer { panic_once: Mutex::new(Some("handleConn")), ..FakeAnalyzer::default() };
    analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    let h = harness_with(analyzer, vec!["other:handleConn".parse().unwrap()], ReturnSitePolicy::Reject);
    h.inspector.spawn(41, 1000, "app", "/app/server", &[]);

    let mut workers = RebuildWorkers::spawn(Arc::clone(&h.store), 1, 16).unwrap();
    assert!(workers.request(Pid(41)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while workers.pending() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(workers.pending(), 0);
    assert!(h.store.lookup(Pid(41)).is_none());

    // Same single worker picks up the retry
    assert!(workers.request(Pid(41)));
    workers.shutdown();
    assert_eq!(h.store.lookup(Pid(41)).unwrap().uprobes.len(), 1);
    assert_eq!(h.store.stats().builds_started, 2);
    assert_eq!(h.store.stats().builds_succeeded, 1);
}

#[test]
fn test_sweeper_thread_evicts_in_background() {
    let h = harness(&["other:handleConn"]);
    h.inspector.spawn(50, 1000, "app", "/app/server", &[]);
    h.analyzer.add("/app/server", "handleConn", 0x401000, 0x80, &[]);
    h.store.get_or_build(Pid(50)).unwrap();

    let mut sweeper = Sweeper::spawn(Arc::clone(&h.store), Duration::from_millis(10)).unwrap();
    h.inspector.kill(50);

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.store.stats().evictions == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    sweeper.stop();

    assert!(h.store.lookup(Pid(50)).is_none());
    assert!(h.registry.is_empty());
    assert_eq!(h.store.stats().evictions, 1);
}
