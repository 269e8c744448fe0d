//! procfs-backed process inspection
//!
//! Start time comes from `/proc/<pid>/stat` (clock ticks since boot) and is
//! converted to milliseconds since the Unix epoch with the boot time from
//! `/proc/stat`, so fingerprints stay comparable across readings.

use anyhow::{Context, Result};
use log::debug;
use procfs::process::Process;
use std::fs;
use std::path::PathBuf;

use super::{resolve_host_path, ProcessInspector};
use crate::domain::{Pid, ProcessFingerprint};
use crate::symbolization::memory_maps::mapped_regions;

/// Reads process identity and layout from the live `/proc`
pub struct ProcfsInspector {
    boot_time_ms: u64,
    ticks_per_second: u64,
}

impl ProcfsInspector {
    /// # Errors
    /// Returns an error if the boot time cannot be read from `/proc/stat`
    pub fn new() -> Result<Self> {
        let boot_time_secs = procfs::boot_time_secs().context("Failed to read btime from /proc/stat")?;
        let ticks_per_second = procfs::ticks_per_second().max(1);
        Ok(Self { boot_time_ms: boot_time_secs * 1000, ticks_per_second })
    }

    fn start_time_ms(&self, start_ticks: u64) -> u64 {
        self.boot_time_ms + start_ticks * 1000 / self.ticks_per_second
    }
}

impl ProcessInspector for ProcfsInspector {
    fn fingerprint_of(&self, pid: Pid) -> Option<ProcessFingerprint> {
        let process = Process::new(pid.into()).ok()?;
        let stat = process.stat().ok()?;
        let netns_id = netns_id(pid).unwrap_or_else(|| {
            debug!("No network namespace for {pid}, using 0");
            0
        });
        Some(ProcessFingerprint::new(self.start_time_ms(stat.starttime), netns_id, stat.comm.as_str()))
    }

    fn exe_path(&self, pid: Pid) -> Option<PathBuf> {
        let process = Process::new(pid.into()).ok()?;
        let exe = process.exe().ok()?;
        Some(resolve_host_path(pid, &exe))
    }

    fn mapped_paths(&self, pid: Pid) -> Vec<PathBuf> {
        let regions = match mapped_regions(pid) {
            Ok(regions) => regions,
            Err(e) => {
                debug!("No mappings for {pid}: {e:#}");
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = Vec::new();
        for region in regions {
            let host_path = resolve_host_path(pid, &region.path);
            if !paths.contains(&host_path) {
                paths.push(host_path);
            }
        }
        paths
    }
}

/// Network namespace inode from the `/proc/<pid>/ns/net` link (`net:[4026531993]`)
fn netns_id(pid: Pid) -> Option<u64> {
    let target = fs::read_link(format!("/proc/{}/ns/net", pid.0)).ok()?;
    parse_ns_link(&target.to_string_lossy())
}

fn parse_ns_link(link: &str) -> Option<u64> {
    let open = link.find('[')?;
    let close = link.rfind(']')?;
    if open >= close {
        return None;
    }
    link[open + 1..close].parse().ok()
}

/// Whether `pid` is a thread-group leader (a process, not a thread)
pub fn is_process(pid: Pid) -> bool {
    check_process(pid, false)
}

/// Whether `pid` is a user-space process (kernel threads excluded)
pub fn is_user_process(pid: Pid) -> bool {
    check_process(pid, true)
}

fn check_process(pid: Pid, user_only: bool) -> bool {
    let Ok(process) = Process::new(pid.into()) else {
        return false;
    };
    let Ok(status) = process.status() else {
        return false;
    };

    // Kernel threads are children of PID 0 (init excepted) or kthreadd (PID 2)
    if user_only && ((status.ppid == 0 && status.pid != 1) || status.ppid == 2) {
        return false;
    }

    status.tgid == status.pid
}
