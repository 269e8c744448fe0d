//! Rebuild pool keeping cache builds off the event path
//!
//! Event handlers call [`RebuildWorkers::lookup`], which answers from the
//! published cache or queues a build and returns immediately.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, warn};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::{CacheHandle, SymbolCacheStore};
use crate::domain::Pid;

pub struct RebuildWorkers {
    store: Arc<SymbolCacheStore>,
    tx: Option<Sender<Pid>>,
    /// Pids queued or being built
    pending: Arc<Mutex<HashSet<Pid>>>,
    handles: Vec<JoinHandle<()>>,
}

fn lock(pending: &Mutex<HashSet<Pid>>) -> MutexGuard<'_, HashSet<Pid>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

impl RebuildWorkers {
    /// Start the pool sized by the store's `rebuild_workers` and
    /// `rebuild_queue_depth`
    pub fn from_config(store: Arc<SymbolCacheStore>) -> Result<Self> {
        let workers = store.config().rebuild_workers;
        let depth = store.config().rebuild_queue_depth;
        Self::spawn(store, workers, depth)
    }

    /// Start `workers` threads fed by a queue of `depth` requests
    pub fn spawn(store: Arc<SymbolCacheStore>, workers: usize, depth: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Pid>(depth.max(1));
        let pending = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let store = Arc::clone(&store);
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("symcache-rebuild-{i}"))
                .spawn(move || {
                    for pid in rx.iter() {
                        // A panicking build loses this request only
                        match panic::catch_unwind(AssertUnwindSafe(|| store.get_or_build(pid))) {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => debug!("Queued rebuild of {pid} failed: {e}"),
                            Err(_) => warn!("Queued rebuild of {pid} panicked"),
                        }
                        lock(&pending).remove(&pid);
                    }
                })
                .context("Failed to spawn rebuild worker")?;
            handles.push(handle);
        }

        Ok(Self { store, tx: Some(tx), pending, handles })
    }

    /// Queue a build for `pid`
    ///
    /// Returns `false` when the request was coalesced with a pending one or
    /// dropped because the queue is full.
    pub fn request(&self, pid: Pid) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let mut pending = lock(&self.pending);
        if pending.contains(&pid) {
            return false;
        }
        match tx.try_send(pid) {
            Ok(()) => {
                pending.insert(pid);
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("Rebuild queue full, dropping request for {pid}");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Published cache for `pid`, or `None` after queueing a build
    pub fn lookup(&self, pid: Pid) -> Option<CacheHandle> {
        let cache = self.store.lookup(pid);
        if cache.is_none() {
            self.request(pid);
        }
        cache
    }

    /// Requests queued or in progress
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drain the queue and join every worker
    pub fn shutdown(&mut self) {
        drop(self.tx.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for RebuildWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}
