//! Background worker supervision.
//!
//! Every long-running loop is spawned through a [`WorkerSet`] that hands it
//! a stop signal and keeps its join handle. Teardown is ordered by the
//! caller: stop accepting HTTP first, then signal workers and wait for
//! them, then close clients.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

pub struct WorkerSet {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSet {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A fresh stop-signal receiver for a worker loop.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawns a named worker task.
    pub fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.handles.push((name.to_string(), handle));
        info!(worker = name, "worker spawned");
    }

    /// Signals every worker and waits for them, bounded per worker.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.handles {
            match timeout(grace, handle).await {
                Ok(Ok(())) => info!(worker = name, "worker stopped"),
                Ok(Err(e)) => warn!(worker = name, error = %e, "worker panicked"),
                Err(_) => warn!(worker = name, "worker did not stop in time; detaching"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn workers_stop_on_signal() {
        let mut set = WorkerSet::new();
        let mut rx = set.stop_signal();
        set.spawn("test-loop", async move {
            loop {
                if rx.changed().await.is_err() || *rx.borrow() {
                    break;
                }
            }
        });
        set.shutdown(Duration::from_secs(1)).await;
    }
}
