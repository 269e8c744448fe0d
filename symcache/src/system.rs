//! Host capability queries
//!
//! Kernel release and CPU topology, read from `/proc` and `/sys`. The cache
//! only consults these to pick strategy variants (worker pool size, warnings
//! about uprobe support); they are not part of its state machine.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::fmt;
use std::fs;

/// Kernels older than this cannot create uprobes by file offset through the
/// `perf_event_open` uprobe PMU
pub const MIN_UPROBE_PMU_KERNEL: KernelVersion = KernelVersion { major: 4, minor: 17, patch: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    /// Read the running kernel's release from `/proc/sys/kernel/osrelease`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not start with a
    /// `major.minor` release
    pub fn current() -> Result<Self> {
        let release = fs::read_to_string("/proc/sys/kernel/osrelease")
            .context("Failed to read /proc/sys/kernel/osrelease")?;
        Self::parse(release.trim())
            .with_context(|| format!("Unrecognised kernel release '{}'", release.trim()))
    }

    /// Parse a release string like `5.15.0-91-generic` or `6.1.0-arch1-1`
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.split(['.', '-', '+']);
        let major = parts.next()?.parse().ok()?;
        let minor = numeric_prefix(parts.next()?)?;
        let patch = parts.next().and_then(numeric_prefix).unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

fn numeric_prefix(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Get the number of online CPUs from /sys/devices/system/cpu/online
///
/// The format in /sys is like "0-3" or "0-3,8-11" for NUMA systems.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed
pub fn online_cpus() -> Result<usize> {
    let content = fs::read_to_string("/sys/devices/system/cpu/online")
        .context("Failed to read /sys/devices/system/cpu/online")?;
    parse_cpu_list(content.trim())
}

fn parse_cpu_list(list: &str) -> Result<usize> {
    let mut count = 0;
    for range in list.split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            let start: usize = start.parse()?;
            let end: usize = end.parse()?;
            count += end.saturating_sub(start) + 1;
        } else {
            let _cpu: usize = range.parse()?;
            count += 1;
        }
    }
    Ok(count)
}

/// Snapshot of the host facts the cache cares about
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub kernel: Option<KernelVersion>,
    pub online_cpus: usize,
}

impl Capabilities {
    /// Query the host; unreadable facts degrade to conservative defaults
    pub fn detect() -> Self {
        let kernel = match KernelVersion::current() {
            Ok(version) => Some(version),
            Err(e) => {
                warn!("Kernel version unavailable: {e:#}");
                None
            }
        };
        let online_cpus = online_cpus().unwrap_or_else(|e| {
            warn!("Online CPU count unavailable, assuming 1: {e:#}");
            1
        });
        debug!("Host capabilities: kernel={kernel:?}, online_cpus={online_cpus}");
        Self { kernel, online_cpus }
    }

    /// Whether offset-based uprobes can be created on this kernel
    ///
    /// Unknown kernels are assumed capable.
    #[must_use]
    pub fn supports_uprobe_pmu(&self) -> bool {
        self.kernel.map_or(true, |k| k >= MIN_UPROBE_PMU_KERNEL)
    }
}
