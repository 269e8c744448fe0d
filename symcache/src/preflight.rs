//! Pre-flight checks for symcache
//!
//! Validates that the target process can be inspected before any symbol is
//! resolved, with actionable messages when it can't.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use log::warn;
use std::path::Path;

use crate::domain::Pid;
use crate::process::is_user_process;
use crate::system::{Capabilities, MIN_UPROBE_PMU_KERNEL};

/// Run all pre-flight checks for `pid`
pub fn run_preflight_checks(pid: Pid, caps: &Capabilities) -> Result<()> {
    check_process_exists(pid)?;
    check_user_process(pid)?;
    check_proc_access(pid)?;
    check_privileges();
    check_kernel(caps);
    Ok(())
}

/// Non-root can only read `/proc/<pid>/exe` and `root/` of its own processes
fn check_privileges() {
    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root: processes of other users cannot be resolved");
    }
}

/// Resolution works on any kernel; attaching by offset needs the uprobe PMU
fn check_kernel(caps: &Capabilities) {
    match caps.kernel {
        Some(kernel) if !caps.supports_uprobe_pmu() => warn!(
            "Kernel {kernel} predates {MIN_UPROBE_PMU_KERNEL}: resolved offsets cannot be attached via perf_event_open"
        ),
        Some(_) => {}
        None => warn!("Kernel version unknown, skipping uprobe support check"),
    }
}

/// Check if the target process exists
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0
        );
    }
    Ok(())
}

/// Kernel threads and non-leader threads have no executable of their own
pub fn check_user_process(pid: Pid) -> Result<()> {
    if !is_user_process(pid) {
        bail!(
            "{pid} is not a user-space process.\n\n\
             Kernel threads and secondary threads cannot be resolved; pass the\n\
             thread group leader instead (see: grep Tgid /proc/{}/status)",
            pid.0
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted",
            pid.0
        )
    })?;
    Ok(())
}
