//! Cache configuration and probe specifications
//!
//! [`CacheConfig`] carries the tunables of the cache service; [`ProbeSpec`]
//! describes one symbol of interest the way the tracing configuration names
//! it, before anything is resolved.

use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::UprobeKind;
use crate::system::Capabilities;

/// Default interval between validator sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on queued rebuild requests
pub const DEFAULT_REBUILD_QUEUE_DEPTH: usize = 1024;

/// Rebuild workers never exceed this, regardless of CPU count
pub const MAX_REBUILD_WORKERS: usize = 4;

/// Name of the tracing configuration used when none is given
pub const DEFAULT_TRACING_CONFIG: &str = "default";

/// What to do when a function has more return sites than can be probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnSitePolicy {
    /// Fail the symbol with `TooManyReturnSites`
    #[default]
    Reject,
    /// Keep the first `FUNC_RET_MAX` sites and log a warning
    Truncate,
}

/// Tunables for the symbol cache service
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub sweep_interval: Duration,
    pub rebuild_workers: usize,
    pub rebuild_queue_depth: usize,
    pub return_site_policy: ReturnSitePolicy,
    /// Registry group that resolved uprobes are added under
    pub tracing_config: String,
}

impl CacheConfig {
    /// Size the rebuild pool from the host's capabilities
    #[must_use]
    pub fn with_capabilities(mut self, caps: &Capabilities) -> Self {
        self.rebuild_workers = caps.online_cpus.clamp(1, MAX_REBUILD_WORKERS);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            rebuild_workers: 1,
            rebuild_queue_depth: DEFAULT_REBUILD_QUEUE_DEPTH,
            return_site_policy: ReturnSitePolicy::default(),
            tracing_config: DEFAULT_TRACING_CONFIG.to_string(),
        }
    }
}

/// Where the symbol of a probe lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// The process's main executable (`/proc/<pid>/exe`)
    Executable,
    /// First mapped shared object whose file name starts with the prefix
    Library(String),
}

/// One symbol the tracer wants instrumented
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub kind: UprobeKind,
    pub symbol: String,
    /// Name of the kernel-side program attached at this symbol
    pub probe_function: String,
    pub is_return_probe: bool,
    pub target: ProbeTarget,
}

impl ProbeSpec {
    pub fn new(kind: UprobeKind, symbol: &str, is_return_probe: bool) -> Self {
        let prefix = if is_return_probe { "uretprobe" } else { "uprobe" };
        let probe_function = format!("{prefix}_{}", sanitize_symbol(symbol));
        let target = match kind {
            UprobeKind::OpenSsl => ProbeTarget::Library("libssl.so".to_string()),
            UprobeKind::GoRuntime | UprobeKind::Other => ProbeTarget::Executable,
        };
        Self { kind, symbol: symbol.to_string(), probe_function, is_return_probe, target }
    }
}

impl fmt::Display for ProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.symbol)?;
        if self.is_return_probe {
            write!(f, ":ret")?;
        }
        Ok(())
    }
}

/// Parses the CLI form `kind:symbol[:ret]`, e.g. `openssl:SSL_write:ret`
impl FromStr for ProbeSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(kind), Some(symbol)) = (parts.next(), parts.next()) else {
            bail!("Invalid probe '{s}', expected kind:symbol[:ret]");
        };
        let kind = match kind {
            "go" => UprobeKind::GoRuntime,
            "openssl" => UprobeKind::OpenSsl,
            "other" => UprobeKind::Other,
            _ => bail!("Unknown probe kind '{kind}' (expected go, openssl or other)"),
        };
        if symbol.is_empty() {
            bail!("Invalid probe '{s}': empty symbol");
        }
        let is_return_probe = match parts.next() {
            None => false,
            Some("ret") => true,
            Some(other) => bail!("Invalid probe suffix '{other}' (expected ret)"),
        };
        Ok(ProbeSpec::new(kind, symbol, is_return_probe))
    }
}

/// Turn a Go or C symbol into an identifier-safe program suffix
///
/// `crypto/tls.(*Conn).Write` → `crypto_tls_conn_write`
fn sanitize_symbol(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    for c in symbol.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Default probe set: Go scheduler/TLS entry points and OpenSSL I/O
#[must_use]
pub fn builtin_probes() -> Vec<ProbeSpec> {
    vec![
        ProbeSpec::new(UprobeKind::GoRuntime, "runtime.casgstatus", false),
        ProbeSpec::new(UprobeKind::GoRuntime, "runtime.newproc1", true),
        ProbeSpec::new(UprobeKind::GoRuntime, "crypto/tls.(*Conn).Write", false),
        ProbeSpec::new(UprobeKind::GoRuntime, "crypto/tls.(*Conn).Read", false),
        ProbeSpec::new(UprobeKind::GoRuntime, "crypto/tls.(*Conn).Read", true),
        ProbeSpec::new(UprobeKind::OpenSsl, "SSL_write", false),
        ProbeSpec::new(UprobeKind::OpenSsl, "SSL_write", true),
        ProbeSpec::new(UprobeKind::OpenSsl, "SSL_read", false),
        ProbeSpec::new(UprobeKind::OpenSsl, "SSL_read", true),
    ]
}
