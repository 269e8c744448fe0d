//! ELF binary analysis backed by the `object` crate
//!
//! Binaries are memory-mapped per request rather than cached here; the
//! symbol cache above already memoizes the results per process.

#![allow(unsafe_code)] // Mmap::map requires unsafe

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use memmap2::Mmap;
use object::{Architecture, Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use std::fs::File;
use std::path::Path;

use super::memory_maps::mapping_base;
use super::return_sites::{CodeArch, FunctionCode};
use super::{BinaryAnalyzer, SymbolLocation};
use crate::domain::{Pid, ResolutionError, UprobeKind, VersionInfo};

const PAGE_SIZE: u64 = 4096;

/// Magic at the start of `.go.buildinfo`
const GO_BUILDINFO_MAGIC: &[u8] = b"\xff Go buildinf:";
/// Flag bit: version strings are stored inline (Go 1.18+)
const GO_BUILDINFO_INLINE: u8 = 0x2;
/// Offset of the inline version string
const GO_BUILDINFO_HEADER_LEN: usize = 32;

/// [`BinaryAnalyzer`] for ELF executables and shared objects
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfAnalyzer;

impl ElfAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

fn map_binary(binary: &Path) -> Result<Mmap, ResolutionError> {
    let unreadable = || ResolutionError::BinaryUnreadable { path: binary.to_path_buf() };
    let file = File::open(binary).map_err(|e| {
        warn!("Cannot open {}: {e}", binary.display());
        unreadable()
    })?;
    unsafe { Mmap::map(&file) }.map_err(|e| {
        warn!("Cannot map {}: {e}", binary.display());
        unreadable()
    })
}

fn parse<'a>(binary: &Path, data: &'a [u8]) -> Result<object::File<'a>, ResolutionError> {
    object::File::parse(data).map_err(|e| {
        warn!("Cannot parse {}: {e}", binary.display());
        ResolutionError::BinaryUnreadable { path: binary.to_path_buf() }
    })
}

/// Look in `.symtab` first (full names, sizes), then `.dynsym`
fn find_symbol(obj: &object::File<'_>, name: &str) -> Option<SymbolLocation> {
    obj.symbols()
        .chain(obj.dynamic_symbols())
        .find(|sym| {
            sym.kind() == SymbolKind::Text && sym.address() != 0 && sym.name().is_ok_and(|n| n == name)
        })
        .map(|sym| SymbolLocation { offset: sym.address(), size: sym.size() })
}

fn code_arch(obj: &object::File<'_>) -> CodeArch {
    match obj.architecture() {
        Architecture::X86_64 => CodeArch::X86_64,
        Architecture::Aarch64 => CodeArch::Aarch64,
        _ => CodeArch::Unsupported,
    }
}

/// Bytes of `[location.offset, location.offset + size)` from the section holding them
fn code_bytes(obj: &object::File<'_>, location: SymbolLocation) -> Result<Vec<u8>> {
    let section = obj
        .sections()
        .find(|s| location.offset >= s.address() && location.offset < s.address() + s.size())
        .context("No section contains the function")?;
    let data = section.data()?;

    #[allow(clippy::cast_possible_truncation)]
    let start = (location.offset - section.address()) as usize;
    #[allow(clippy::cast_possible_truncation)]
    let end = start.saturating_add(location.size as usize).min(data.len());
    if start >= data.len() {
        // .bss-like sections have no file data
        bail!("Function lies outside the section's file data");
    }
    Ok(data[start..end].to_vec())
}

/// Lowest `PT_LOAD` virtual address, rounded down to a page
fn first_load_address(obj: &object::File<'_>) -> u64 {
    obj.segments().map(|seg| seg.address()).min().unwrap_or(0) & !(PAGE_SIZE - 1)
}

/// Go toolchain version from `.go.buildinfo`
///
/// Only the inline layout (Go 1.18+) carries the version in the section
/// itself; older binaries are still recognised as Go with version 0.0.0.
fn go_version(obj: &object::File<'_>) -> Option<VersionInfo> {
    let Some(section) = obj.section_by_name(".go.buildinfo") else {
        return obj.section_by_name(".gopclntab").map(|_| VersionInfo::default());
    };
    let data = section.data().ok()?;
    if !data.starts_with(GO_BUILDINFO_MAGIC) {
        return None;
    }

    let flags = *data.get(GO_BUILDINFO_MAGIC.len() + 1)?;
    if flags & GO_BUILDINFO_INLINE == 0 {
        debug!("Pre-1.18 Go build info, version unknown");
        return Some(VersionInfo::default());
    }

    let (len, used) = read_uvarint(data.get(GO_BUILDINFO_HEADER_LEN..)?)?;
    let start = GO_BUILDINFO_HEADER_LEN + used;
    #[allow(clippy::cast_possible_truncation)]
    let raw = data.get(start..start + len as usize)?;
    let version = std::str::from_utf8(raw).ok()?;
    Some(VersionInfo::parse_go(version).unwrap_or_default())
}

/// Decode an unsigned LEB128 varint; returns (value, bytes consumed)
fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

impl BinaryAnalyzer for ElfAnalyzer {
    fn symbol_offset(&self, binary: &Path, name: &str) -> Result<Option<SymbolLocation>, ResolutionError> {
        let mmap = map_binary(binary)?;
        let obj = parse(binary, &mmap)?;
        let location = find_symbol(&obj, name);
        debug!("Symbol {name} in {}: {location:?}", binary.display());
        Ok(location)
    }

    fn load_bias(&self, pid: Pid, binary: &Path) -> u64 {
        let Ok(mmap) = map_binary(binary) else {
            return 0;
        };
        let Ok(obj) = parse(binary, &mmap) else {
            return 0;
        };
        if obj.kind() == ObjectKind::Executable {
            return 0;
        }

        match mapping_base(pid, binary) {
            Ok(Some(base)) => base.saturating_sub(first_load_address(&obj)),
            Ok(None) => 0,
            Err(e) => {
                debug!("No load bias for {} in {pid}: {e:#}", binary.display());
                0
            }
        }
    }

    fn function_code(&self, binary: &Path, location: SymbolLocation) -> Result<FunctionCode, ResolutionError> {
        let mmap = map_binary(binary)?;
        let obj = parse(binary, &mmap)?;
        let bytes = code_bytes(&obj, location).map_err(|e| {
            debug!("No code at 0x{:x} in {}: {e:#}", location.offset, binary.display());
            ResolutionError::ResolutionFailed { symbol: format!("0x{:x}", location.offset) }
        })?;
        Ok(FunctionCode { arch: code_arch(&obj), bytes })
    }

    fn version(&self, binary: &Path, kind: UprobeKind) -> Result<Option<VersionInfo>, ResolutionError> {
        match kind {
            UprobeKind::GoRuntime => {
                let mmap = map_binary(binary)?;
                let obj = parse(binary, &mmap)?;
                Ok(go_version(&obj))
            }
            UprobeKind::OpenSsl => Ok(binary
                .file_name()
                .and_then(|f| f.to_str())
                .and_then(VersionInfo::parse_openssl_soname)),
            UprobeKind::Other => Ok(None),
        }
    }
}
