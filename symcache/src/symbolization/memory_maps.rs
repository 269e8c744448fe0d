//! Memory mapping utilities for process address space analysis
//!
//! Reads /proc/pid/maps through `procfs` to find where a binary was mapped,
//! which is the starting point of its load bias for position-independent
//! objects. Process inspection uses the same region list for mapped paths.

use anyhow::{Context, Result};
use log::debug;
use procfs::process::{MMapPath, Process};
use std::path::{Path, PathBuf};

use crate::domain::Pid;

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One file-backed line of /proc/pid/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRegion {
    pub range: MemoryRange,
    /// Offset into the backing file
    pub file_offset: u64,
    pub path: PathBuf,
}

/// File-backed regions of `pid`'s address space, in address order
///
/// # Errors
/// Returns an error if /proc/pid/maps cannot be read
pub fn mapped_regions(pid: Pid) -> Result<Vec<MappedRegion>> {
    let process = Process::new(pid.into()).with_context(|| format!("Failed to open /proc/{}", pid.0))?;
    let maps = process.maps().with_context(|| format!("Failed to read /proc/{}/maps", pid.0))?;

    Ok(maps
        .into_iter()
        .filter_map(|map| match map.pathname {
            MMapPath::Path(path) => Some(MappedRegion {
                range: MemoryRange { start: map.address.0, end: map.address.1 },
                file_offset: map.offset,
                path,
            }),
            _ => None,
        })
        .collect())
}

/// Start address of the mapping that covers file offset 0 of `binary`
///
/// `binary` may be a host path rewritten through `/proc/<pid>/root`; the
/// prefix is stripped before comparing with the process's own view.
///
/// # Errors
/// Returns an error if /proc/pid/maps cannot be read
pub fn mapping_base(pid: Pid, binary: &Path) -> Result<Option<u64>> {
    Ok(find_mapping_base(&mapped_regions(pid)?, pid, binary))
}

fn find_mapping_base(regions: &[MappedRegion], pid: Pid, binary: &Path) -> Option<u64> {
    let root = format!("/proc/{}/root", pid.0);
    let wanted = binary.strip_prefix(&root).map_or_else(
        |_| binary.to_path_buf(),
        |relative| Path::new("/").join(relative),
    );

    let base = regions
        .iter()
        .filter(|r| r.file_offset == 0 && r.path == wanted)
        .map(|r| r.range.start)
        .min();

    match base {
        Some(start) => debug!("{} mapped at 0x{start:x} in {pid}", wanted.display()),
        None => debug!("{} not mapped in {pid}", wanted.display()),
    }
    base
}
