//! Shutdown coordination for the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::TryRecvError};

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
/// Subscribers created after the trigger still observe it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            fired: self.triggered.load(Ordering::SeqCst),
        }
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// One task's view of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
    fired: bool,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered. Cancel safe.
    pub async fn recv(&mut self) {
        if self.fired {
            return;
        }
        // A closed or lagged channel also means the coordinator is gone.
        let _ = self.rx.recv().await;
        self.fired = true;
    }

    pub fn is_shutdown(&mut self) -> bool {
        if !self.fired {
            match self.rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => self.fired = true,
            }
        }
        self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribers_see_trigger() {
        let shutdown = Shutdown::new();
        let mut early = shutdown.subscribe();
        assert!(!early.is_shutdown());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), early.recv()).await.unwrap();
        assert!(early.is_shutdown());

        let mut late = shutdown.subscribe();
        assert!(late.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), late.recv()).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_coordinator_counts_as_shutdown() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), signal.recv()).await.unwrap();
        assert!(signal.is_shutdown());
    }
}
