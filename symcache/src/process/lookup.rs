//! Find a PID from a process name.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::domain::{Comm, Pid};

/// A process matching a name lookup
#[derive(Debug)]
pub struct ProcessMatch {
    pub pid: Pid,
    pub exe_path: PathBuf,
    pub comm: Comm,
}

/// Find the single process matching `name`.
///
/// Matches against the `comm` from `/proc/<pid>/stat` and the basename of
/// `/proc/<pid>/exe`. Kernel threads (no exe link) never match.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessMatch> {
    let mut matches: Vec<ProcessMatch> = Vec::new();

    for process in procfs::process::all_processes()?.flatten() {
        let Ok(exe_path) = process.exe() else {
            continue;
        };
        let Ok(stat) = process.stat() else {
            continue;
        };

        if is_match(&stat.comm, &exe_path, name) {
            matches.push(ProcessMatch {
                pid: Pid::from(process.pid),
                exe_path,
                comm: Comm::new(&stat.comm),
            });
        }
    }

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.comm)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: symcache --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Check if a process matches the search pattern.
fn is_match(comm: &str, exe_path: &Path, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

    let pattern_basename =
        Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    // comm is cut at 15 visible bytes, so a long pattern only matches by prefix
    comm == pattern_basename
        || exe_basename == pattern_basename
        || (comm.len() >= 15 && pattern_basename.starts_with(comm))
}
