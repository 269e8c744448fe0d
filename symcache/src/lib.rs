//! # symcache - Process-Aware Symbol Cache for Uprobe Tracing
//!
//! symcache is the user-space half of a uprobe-based tracer. It resolves the
//! runtime addresses of the functions a tracer instruments (Go runtime and
//! TLS entry points, OpenSSL I/O calls) and keeps them per process, so that
//! kernel events for a known process never trigger another symbol lookup.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 kernel events (carry a PID)                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ lookup(pid)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       symcache (This Crate)                     │
//! │                                                                 │
//! │  ┌──────────────┐  miss  ┌──────────────┐  ┌──────────────┐    │
//! │  │ Cache Store  │──────▶│   Rebuild    │─▶│   Symbol     │    │
//! │  │ (pid → cache)│        │   Workers    │  │   Resolver   │    │
//! │  └──────┬───────┘        └──────────────┘  └──────┬───────┘    │
//! │         │ sweep                                   │            │
//! │         ▼                                         ▼            │
//! │  ┌──────────────┐        ┌──────────────┐  ┌──────────────┐    │
//! │  │   Sweeper    │        │   Uprobe     │  │  ElfAnalyzer │    │
//! │  │ (fingerprint │        │   Registry   │  │ (object,     │    │
//! │  │  validation) │        │              │  │  iced-x86)   │    │
//! │  └──────────────┘        └──────────────┘  └──────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`cache`]: pid-keyed store, sweeper thread and rebuild workers
//! - [`uprobe`]: resolved targets and the per-configuration registry
//! - [`symbolization`]: ELF symbol lookup, load bias, return-site discovery
//! - [`process`]: process fingerprints and layout via `/proc`
//! - [`domain`]: core types (Pid, ProcessFingerprint) and errors
//! - [`config`]: cache tunables and probe specifications
//! - [`system`]: kernel version and CPU topology queries
//! - [`cli`], [`preflight`]: the `symcache` binary's front end
//!
//! ## PID Reuse
//!
//! Every cache entry remembers the [`ProcessFingerprint`](domain::ProcessFingerprint)
//! (start time, network namespace, comm) of the process it was built for.
//! When the PID is recycled the start time changes, and the entry and its
//! uprobes are dropped before anything new is resolved for that PID.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Resolve the built-in probe set for a running process
//! sudo ./symcache --pid <PID>
//!
//! # Keep validating while the process runs
//! sudo ./symcache my-app --watch 5 --json
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod domain;
pub mod preflight;
pub mod process;
pub mod symbolization;
pub mod system;
pub mod uprobe;
