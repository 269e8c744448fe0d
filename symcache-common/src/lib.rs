//! # Shared Data Structures (Userspace ↔ eBPF)
//!
//! Bounds and records shared between the userspace symbol cache and the
//! kernel-side uprobe programs. All records use `#[repr(C)]` so an attach
//! layer can copy them verbatim into a BPF map.
//!
//! ## Key Types
//!
//! - [`UprobeAttachTarget`] - One resolved instrumentation target, flattened
//! - [`FUNC_RET_MAX`] - Upper bound on return sites tracked per function
//! - [`TASK_COMM_LEN`] - Kernel `comm` buffer size

#![no_std]

// ============================================================================
// Bounds
// ============================================================================

/// Maximum number of physical return sites tracked for a single function
///
/// Functions compiled into more exit points than this cannot be covered by
/// return-site probes and are reported instead of partially attached.
pub const FUNC_RET_MAX: usize = 32;

/// Size of the kernel `task_struct::comm` buffer (process short name)
pub const TASK_COMM_LEN: usize = 16;

// ============================================================================
// Flags
// ============================================================================

/// Target wants return-site probes in addition to the entry probe
pub const TARGET_FLAG_RETURN_PROBE: u32 = 1 << 0;

/// Target lives in a Go binary (uretprobes are unsafe on goroutine stacks)
pub const TARGET_FLAG_GO_RUNTIME: u32 = 1 << 1;

/// Target lives in an OpenSSL library
pub const TARGET_FLAG_OPENSSL: u32 = 1 << 2;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Flattened instrumentation target handed to the attach layer
///
/// Produced from a registry copy, never from registry-owned memory.
///
/// **Memory Layout**: `#[repr(C)]`, 8-byte aligned, 296 bytes
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UprobeAttachTarget {
    /// Process ID the target was resolved for
    pub pid: u32,

    /// Bitwise OR of `TARGET_FLAG_*`
    pub flags: u32,

    /// Process start time (ms since epoch), guards against PID reuse
    pub process_start_time: u64,

    /// Runtime address of the function entry
    pub entry_address: u64,

    /// Function size in bytes
    pub size: u64,

    /// Return-site addresses; only the first `return_count` are valid
    pub return_addresses: [u64; FUNC_RET_MAX],

    /// Number of valid entries in `return_addresses`
    pub return_count: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 4],
}

impl UprobeAttachTarget {
    /// Valid return-site addresses
    #[must_use]
    pub fn returns(&self) -> &[u64] {
        let count = (self.return_count as usize).min(FUNC_RET_MAX);
        &self.return_addresses[..count]
    }

    /// Whether `flag` is set
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

impl Default for UprobeAttachTarget {
    fn default() -> Self {
        Self {
            pid: 0,
            flags: 0,
            process_start_time: 0,
            entry_address: 0,
            size: 0,
            return_addresses: [0; FUNC_RET_MAX],
            return_count: 0,
            _padding: [0; 4],
        }
    }
}
