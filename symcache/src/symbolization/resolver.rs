//! Symbol resolution into uprobe targets

use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;

use symcache_common::FUNC_RET_MAX;

use super::return_sites::find_return_offsets;
use super::{BinaryAnalyzer, SymbolLocation};
use crate::config::{ProbeSpec, ReturnSitePolicy};
use crate::domain::{Pid, ProcessFingerprint, ResolutionError, UprobeKind, VersionInfo};
use crate::uprobe::{ReturnSites, SymbolUprobe};

/// Resolves symbols against a [`BinaryAnalyzer`]
///
/// Holds no cache of its own; repeated calls re-read the binary.
#[derive(Clone)]
pub struct SymbolResolver {
    analyzer: Arc<dyn BinaryAnalyzer>,
    policy: ReturnSitePolicy,
}

impl SymbolResolver {
    pub fn new(analyzer: Arc<dyn BinaryAnalyzer>, policy: ReturnSitePolicy) -> Self {
        Self { analyzer, policy }
    }

    /// Offset and size of `name` within `binary`
    pub fn resolve(&self, binary: &Path, name: &str) -> Result<SymbolLocation, ResolutionError> {
        self.analyzer
            .symbol_offset(binary, name)?
            .ok_or_else(|| ResolutionError::ResolutionFailed { symbol: name.to_string() })
    }

    /// Version of the runtime or library `binary` belongs to, if recognised
    pub fn version(&self, binary: &Path, kind: UprobeKind) -> Result<Option<VersionInfo>, ResolutionError> {
        self.analyzer.version(binary, kind)
    }

    /// Resolve `spec` inside `binary` as mapped by the process `pid`
    pub fn resolve_uprobe(
        &self,
        pid: Pid,
        fingerprint: &ProcessFingerprint,
        binary: &Path,
        spec: &ProbeSpec,
    ) -> Result<SymbolUprobe, ResolutionError> {
        let location = self.resolve(binary, &spec.symbol)?;
        let entry_address = self.analyzer.load_bias(pid, binary) + location.offset;

        let return_addresses = if spec.is_return_probe {
            self.return_sites(binary, &spec.symbol, location, entry_address)?
        } else {
            ReturnSites::new()
        };

        debug!(
            "Resolved {} in {} for {pid}: 0x{entry_address:x} (+{} bytes, {} return sites)",
            spec.symbol,
            binary.display(),
            location.size,
            return_addresses.len()
        );

        Ok(SymbolUprobe::resolved(
            spec,
            pid,
            fingerprint.start_time_ms,
            binary.to_path_buf(),
            entry_address,
            location.size,
            self.version(binary, spec.kind)?.unwrap_or_default(),
            return_addresses,
        ))
    }

    fn return_sites(
        &self,
        binary: &Path,
        symbol: &str,
        location: SymbolLocation,
        entry_address: u64,
    ) -> Result<ReturnSites, ResolutionError> {
        let code = self.analyzer.function_code(binary, location)?;
        let addresses: Vec<u64> = find_return_offsets(&code)
            .into_iter()
            .map(|offset| entry_address + offset)
            .collect();

        let addresses = match ReturnSites::try_from_vec(addresses) {
            Ok(sites) => return Ok(sites),
            Err(addresses) => addresses,
        };

        match self.policy {
            ReturnSitePolicy::Reject => Err(ResolutionError::TooManyReturnSites {
                symbol: symbol.to_string(),
                found: addresses.len(),
            }),
            ReturnSitePolicy::Truncate => {
                warn!(
                    "{symbol} has {} return sites, probing only the first {FUNC_RET_MAX}",
                    addresses.len()
                );
                Ok(ReturnSites::truncated(addresses))
            }
        }
    }
}
