//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep process identity, short names and version
//! triples from being confused with the raw integers and strings they wrap.

use serde::Serialize;
use std::fmt;
use symcache_common::TASK_COMM_LEN;

/// Process ID
///
/// Represents a process ID (TGID in kernel terms). PIDs are recycled by the
/// kernel, so a `Pid` alone never identifies a process; pair it with a
/// [`ProcessFingerprint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    #[allow(clippy::cast_sign_loss)]
    fn from(pid: i32) -> Self {
        Pid(pid as u32)
    }
}

impl From<Pid> for i32 {
    #[allow(clippy::cast_possible_wrap)]
    fn from(pid: Pid) -> Self {
        pid.0 as i32
    }
}

/// Process short name, bounded to the kernel's `comm` buffer
///
/// Longer names are truncated on a character boundary so the value always
/// fits in `TASK_COMM_LEN` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Comm(String);

impl Comm {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(TASK_COMM_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self(name[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Comm {
    fn from(s: &str) -> Self {
        Comm::new(s)
    }
}

/// Identity of the process currently holding a PID
///
/// Captured once and replaced as a whole. Two fingerprints describe the same
/// process when their start time and network namespace agree; `comm` is
/// informational only (a process may rename itself with `prctl`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessFingerprint {
    /// Process creation time, milliseconds since the Unix epoch
    pub start_time_ms: u64,
    /// Inode of the process's network namespace
    pub netns_id: u64,
    pub comm: Comm,
}

impl ProcessFingerprint {
    pub fn new(start_time_ms: u64, netns_id: u64, comm: impl Into<Comm>) -> Self {
        Self { start_time_ms, netns_id, comm: comm.into() }
    }

    /// Whether both fingerprints were taken from the same process
    #[must_use]
    pub fn same_process(&self, other: &ProcessFingerprint) -> bool {
        self.start_time_ms == other.start_time_ms && self.netns_id == other.netns_id
    }
}

impl fmt::Display for ProcessFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (start={}ms, netns={})", self.comm, self.start_time_ms, self.netns_id)
    }
}

/// Family of an instrumentation target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UprobeKind {
    /// Function inside a Go binary
    GoRuntime,
    /// Function exported by libssl
    OpenSsl,
    Other,
}

impl fmt::Display for UprobeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UprobeKind::GoRuntime => "go",
            UprobeKind::OpenSsl => "openssl",
            UprobeKind::Other => "other",
        };
        write!(f, "{name}")
    }
}

/// Version of the runtime or library a target was resolved in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl VersionInfo {
    pub fn new(major: u32, minor: u32, revision: u32) -> Self {
        Self { major, minor, revision }
    }

    /// Parse a Go toolchain version such as `go1.21.5` or `go1.22rc1`
    pub fn parse_go(version: &str) -> Option<Self> {
        let digits = version.strip_prefix("go")?;
        Self::parse_dotted(digits)
    }

    /// Parse the version from an OpenSSL library file name
    ///
    /// `libssl.so.1.1` → 1.1.0, `libssl.so.3` → 3.0.0
    pub fn parse_openssl_soname(file_name: &str) -> Option<Self> {
        let (_, suffix) = file_name.split_once(".so.")?;
        Self::parse_dotted(suffix)
    }

    fn parse_dotted(s: &str) -> Option<Self> {
        let mut parts = s.split('.').map(leading_number);
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let revision = parts.next().flatten().unwrap_or(0);
        Some(Self { major, minor, revision })
    }
}

/// Parse the leading decimal digits of `s` ("22rc1" → 22)
fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}
