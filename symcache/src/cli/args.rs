//! CLI argument definitions

use clap::Parser;
use std::time::Duration;

use crate::config::{CacheConfig, ProbeSpec, ReturnSitePolicy};
use crate::system::Capabilities;

#[derive(Parser, Debug)]
#[command(
    name = "symcache",
    about = "Resolve uprobe targets for a process and keep them valid across PID reuse",
    after_help = "\
EXAMPLES:
    sudo symcache my-app                            Built-in Go and OpenSSL probes
    sudo symcache --pid 1234 --json                 Explicit PID, JSON output
    sudo symcache --pid 1234 --probe other:main     Extra entry probe
    sudo symcache --pid 1234 --watch 2              Re-validate every 2 seconds"
)]
pub struct Args {
    /// Process name to inspect (auto-detects PID)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to inspect
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Extra probe as kind:symbol[:ret] (kind: go, openssl, other); repeatable
    #[arg(long = "probe", value_name = "SPEC")]
    pub probes: Vec<ProbeSpec>,

    /// Only resolve --probe specs, not the built-in set
    #[arg(long, requires = "probes")]
    pub no_builtin: bool,

    /// Seconds between cache validation sweeps
    #[arg(long, default_value = "5", value_name = "SECS")]
    pub sweep_interval: u64,

    /// Rebuild worker threads (default: online CPUs, at most 4)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Keep the first 32 return sites instead of rejecting larger functions
    #[arg(long)]
    pub truncate_return_sites: bool,

    /// Keep running and re-report every N seconds until the process exits
    #[arg(long, value_name = "SECS")]
    pub watch: Option<u64>,

    /// Tracing configuration to register uprobes under
    #[arg(long, default_value = crate::config::DEFAULT_TRACING_CONFIG)]
    pub tracing_config: String,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Log at info level (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Cache configuration for this host; `--workers` wins over CPU count
    pub fn cache_config(&self, caps: &Capabilities) -> CacheConfig {
        let config = CacheConfig::from(self);
        if self.workers.is_some() {
            config
        } else {
            config.with_capabilities(caps)
        }
    }
}

impl From<&Args> for CacheConfig {
    fn from(args: &Args) -> Self {
        let defaults = CacheConfig::default();
        Self {
            sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
            rebuild_workers: args.workers.map_or(defaults.rebuild_workers, |w| w.max(1)),
            return_site_policy: if args.truncate_return_sites {
                ReturnSitePolicy::Truncate
            } else {
                ReturnSitePolicy::Reject
            },
            tracing_config: args.tracing_config.clone(),
            ..defaults
        }
    }
}
