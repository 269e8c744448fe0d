//! # symcache - Main Entry Point
//!
//! Resolves the configured probes for one process and prints them. With
//! `--watch`, keeps the cache validated until the process exits.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use symcache::cache::{CacheHandle, RebuildWorkers, Sweeper, SymbolCacheStore};
use symcache::cli::Args;
use symcache::config::builtin_probes;
use symcache::domain::Pid;
use symcache::preflight::run_preflight_checks;
use symcache::process::lookup::find_process_by_name;
use symcache::process::{is_process, ProcfsInspector};
use symcache::symbolization::{ElfAnalyzer, SymbolResolver};
use symcache::system::Capabilities;
use symcache::uprobe::UprobeRegistry;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    let args = Args::parse();
    let default_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    std::process::exit(match run(&args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// PID from `PROCESS` or `--pid`
fn resolve_pid(args: &Args) -> Result<Pid> {
    if let Some(ref name) = args.process {
        if args.pid.is_some() {
            bail!(
                "Cannot use PROCESS argument with --pid.\n\n\
                 Use either:\n  \
                 symcache my-app              (by name)\n  \
                 symcache --pid 1234          (explicit PID)"
            );
        }
        return Ok(find_process_by_name(name)?.pid);
    }

    if let Some(pid) = args.pid {
        return Ok(Pid::from(pid));
    }

    bail!(
        "Missing required argument: PROCESS or --pid\n\n\
         Usage:\n  \
         symcache my-app              Resolve probes for a process by name\n  \
         symcache --pid 1234          Resolve probes for a PID\n\n\
         Run 'symcache --help' for more options"
    )
}

fn print_cache(cache: &CacheHandle, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(cache.as_ref()).context("Failed to serialize cache")?);
        return Ok(());
    }

    println!("pid: {} ({})", cache.pid.0, cache.fingerprint);
    println!("exe: {}", cache.exe_path.display());
    for uprobe in &cache.uprobes {
        println!(
            "  {:<28} {:<40} 0x{:012x} size={:<6} v{}",
            uprobe.probe_function,
            uprobe.name,
            uprobe.entry_address,
            uprobe.size,
            uprobe.version
        );
        if !uprobe.return_addresses().is_empty() {
            let sites: Vec<String> =
                uprobe.return_addresses().iter().map(|a| format!("0x{a:x}")).collect();
            println!("  {:<28} returns: {}", "", sites.join(" "));
        }
    }
    for failure in &cache.failures {
        println!("  {:<28} {:<40} {}", failure.probe_function, failure.symbol, failure.error);
    }
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let pid = resolve_pid(args)?;
    let caps = Capabilities::detect();
    run_preflight_checks(pid, &caps)?;

    let config = args.cache_config(&caps);
    let mut probes = if args.no_builtin { Vec::new() } else { builtin_probes() };
    probes.extend(args.probes.iter().cloned());

    let inspector = Arc::new(ProcfsInspector::new().context("Failed to read boot time from /proc")?);
    let resolver = SymbolResolver::new(Arc::new(ElfAnalyzer::new()), config.return_site_policy);
    let registry = Arc::new(UprobeRegistry::new());
    let store = Arc::new(SymbolCacheStore::new(
        config.clone(),
        inspector,
        resolver,
        Arc::clone(&registry),
        probes,
    ));

    let cache = store.get_or_build(pid)?;
    print_cache(&cache, args.json)?;

    let Some(secs) = args.watch else {
        return Ok(());
    };

    // The sweeper evicts, the workers rebuild; this loop only reads
    let mut sweeper = Sweeper::spawn(Arc::clone(&store), config.sweep_interval)?;
    let mut workers = RebuildWorkers::from_config(Arc::clone(&store))?;
    let mut last_start = cache.fingerprint.start_time_ms;
    loop {
        std::thread::sleep(Duration::from_secs(secs.max(1)));
        if !is_process(pid) {
            let removed = store.process_exited(pid);
            info!("{pid} exited, {} uprobes removed", removed.len());
            break;
        }
        let orphaned = store.take_orphaned();
        if !orphaned.is_empty() {
            debug!("{} uprobes of recycled pids removed", orphaned.len());
        }
        match workers.lookup(pid) {
            Some(cache) if cache.fingerprint.start_time_ms != last_start => {
                last_start = cache.fingerprint.start_time_ms;
                print_cache(&cache, args.json)?;
            }
            Some(_) => {}
            None => debug!("Cache for {pid} not published, rebuild queued ({} pending)", workers.pending()),
        }
    }
    workers.shutdown();
    sweeper.stop();

    let stats = store.stats();
    eprintln!(
        "builds: {} ok / {} failed, evictions: {}, registered uprobes: {}",
        stats.builds_succeeded,
        stats.builds_failed,
        stats.evictions,
        registry.len()
    );
    Ok(())
}
