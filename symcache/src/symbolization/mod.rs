//! # Symbol Resolution and Address Translation
//!
//! Turns a `(binary, symbol)` pair into the runtime addresses a uprobe is
//! attached at.
//!
//! ## Address Translation
//!
//! Symbol tables record link-time virtual addresses. Position-independent
//! objects (shared libraries, PIE executables) are mapped at a randomised
//! base, so the runtime address is:
//!
//! ```text
//! Runtime Address = Load Bias + Symbol Address
//! Load Bias       = Mapping Start (file offset 0) - First PT_LOAD vaddr (page aligned)
//! ```
//!
//! Non-PIE executables (`ET_EXEC`) have a load bias of zero.
//!
//! ## Return Sites
//!
//! Functions probed on exit in runtimes that forbid uretprobes get one probe
//! per physical return instruction, discovered by decoding the function body
//! (see [`return_sites`]).
//!
//! ## Module Structure
//!
//! - **`elf`**: [`ElfAnalyzer`], the `object`-backed [`BinaryAnalyzer`]
//! - **`memory_maps`**: `/proc/<pid>/maps` parsing for mapping bases
//! - **`resolver`**: [`SymbolResolver`], builds [`SymbolUprobe`](crate::uprobe::SymbolUprobe)s
//! - **`return_sites`**: return instruction discovery (x86-64, AArch64)

pub mod elf;
pub mod memory_maps;
pub mod resolver;
pub mod return_sites;

use std::path::Path;

use crate::domain::{Pid, ResolutionError, UprobeKind, VersionInfo};

pub use elf::ElfAnalyzer;
pub use memory_maps::{mapped_regions, MappedRegion, MemoryRange};
pub use resolver::SymbolResolver;
pub use return_sites::{CodeArch, FunctionCode};

/// Where a symbol lives inside its binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolLocation {
    /// Link-time address of the symbol
    pub offset: u64,
    pub size: u64,
}

/// Symbol-table access for one binary format
///
/// The cache treats this as a black box; tests substitute an in-memory
/// implementation.
pub trait BinaryAnalyzer: Send + Sync {
    /// Find `name` in the binary's symbol tables
    ///
    /// # Errors
    /// `BinaryUnreadable` when the file cannot be opened or parsed.
    /// An absent symbol is `Ok(None)`.
    fn symbol_offset(&self, binary: &Path, name: &str) -> Result<Option<SymbolLocation>, ResolutionError>;

    /// Runtime base adjustment of `binary` inside `pid` (0 if not relocated)
    fn load_bias(&self, pid: Pid, binary: &Path) -> u64;

    /// Machine code of the function at `location`
    ///
    /// # Errors
    /// `BinaryUnreadable` when the file cannot be read, `ResolutionFailed`
    /// when no section contains the function.
    fn function_code(&self, binary: &Path, location: SymbolLocation) -> Result<FunctionCode, ResolutionError>;

    /// Runtime or library version; `Ok(None)` when `binary` is not of `kind`
    ///
    /// # Errors
    /// `BinaryUnreadable` when telling the kind apart requires reading a
    /// file that cannot be opened or parsed.
    fn version(&self, binary: &Path, kind: UprobeKind) -> Result<Option<VersionInfo>, ResolutionError>;
}
