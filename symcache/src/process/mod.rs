//! Process inspection
//!
//! The cache never reads `/proc` directly; it goes through the
//! [`ProcessInspector`] trait so tests can inject a process table and so
//! the procfs-backed implementation stays in one place.
//!
//! - [`ProcfsInspector`]: fingerprints, executable and mapped-object paths
//!   read through the `procfs` crate
//! - [`lookup`]: find a PID from a process name (CLI convenience)

pub mod lookup;
pub mod procfs_inspector;

use std::path::{Path, PathBuf};

use crate::domain::{Pid, ProcessFingerprint};

pub use procfs_inspector::{is_process, is_user_process, ProcfsInspector};

/// Source of process identity and layout
///
/// Implementations must answer `None` as soon as a process is gone; a stale
/// positive would keep a recycled PID's cache alive.
pub trait ProcessInspector: Send + Sync {
    /// Identity of the process currently holding `pid`
    fn fingerprint_of(&self, pid: Pid) -> Option<ProcessFingerprint>;

    /// Host-visible path of the process's main executable
    fn exe_path(&self, pid: Pid) -> Option<PathBuf>;

    /// Host-visible paths of every file-backed mapping, in address order,
    /// without duplicates
    fn mapped_paths(&self, pid: Pid) -> Vec<PathBuf>;
}

/// Resolves a path from a process's mount namespace to the host filesystem.
///
/// Containerised processes see their own root; going through
/// `/proc/<pid>/root` reaches the same file from the host.
pub fn resolve_host_path(pid: Pid, container_path: &Path) -> PathBuf {
    if container_path.starts_with("/proc") {
        return container_path.to_path_buf();
    }

    // /proc/<PID>/root/<CONTAINER_PATH>
    let mut root_path = PathBuf::from(format!("/proc/{}/root", pid.0));
    let relative_path = container_path.strip_prefix("/").unwrap_or(container_path);
    root_path.push(relative_path);

    root_path
}

/// First path whose file name starts with `prefix` (e.g. `libssl.so`)
pub fn find_library<'a>(paths: &'a [PathBuf], prefix: &str) -> Option<&'a PathBuf> {
    paths.iter().find(|path| {
        path.file_name().and_then(|f| f.to_str()).is_some_and(|f| f.starts_with(prefix))
    })
}
