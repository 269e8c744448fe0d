//! Periodic cache validation on a dedicated thread

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::SymbolCacheStore;

/// Handle to the sweeper thread; stops it on drop
pub struct Sweeper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Sweep `store` every `interval` until stopped
    pub fn spawn(store: Arc<SymbolCacheStore>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("symcache-sweeper".to_string())
            .spawn(move || {
                debug!("Sweeper started, interval {interval:?}");
                loop {
                    select! {
                        // Sender dropped or stop requested
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let report = store.sweep();
                            if report.evicted > 0 {
                                info!(
                                    "Sweep evicted {} of {} entries, {} uprobes removed",
                                    report.evicted,
                                    report.checked,
                                    report.removed.len()
                                );
                            }
                        }
                    }
                }
                debug!("Sweeper stopped");
            })
            .context("Failed to spawn sweeper thread")?;

        Ok(Self { stop_tx: Some(stop_tx), handle: Some(handle) })
    }

    /// Stop the thread and wait for an in-flight sweep to finish
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
