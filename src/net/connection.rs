//! Client connection bookkeeping.
//!
//! # Responsibilities
//! - Name the states a client connection moves through
//! - Number connections for log correlation and the CGI environment
//! - Count open connections and wake the shutdown drain when the last one closes

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::observability::metrics;

/// Sequence number of an accepted connection, starting at 1 per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is in its request cycle.
///
/// ```text
/// AwaitingRequest → Parsing → Routing → Handling → Writing → AwaitingRequest
///        │             │                                          (keep-alive)
///        └─────────────┴──→ Closed (idle timeout, EOF, error, shutdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle between requests.
    AwaitingRequest,
    /// Reading the request line and headers.
    Parsing,
    /// Picking the virtual host and handler chain.
    Routing,
    /// Running handlers.
    Handling,
    /// Sending the rest of the response.
    Writing,
    Closed,
}

#[derive(Debug, Default)]
struct Counts {
    open: AtomicU64,
    issued: AtomicU64,
    idle: Notify,
}

/// Open-connection registry shared by every accept loop.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counts: Arc<Counts>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted connection. It counts as open until the
    /// returned guard is dropped.
    pub fn track(&self) -> ConnectionGuard {
        let id = ConnectionId(self.counts.issued.fetch_add(1, Ordering::Relaxed) + 1);
        let open = self.counts.open.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(open);
        ConnectionGuard {
            counts: Arc::clone(&self.counts),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.counts.open.load(Ordering::SeqCst)
    }

    /// Wait for every guard to drop. Returns false if `timeout` passes first.
    pub async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let idle = self.counts.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.active_count() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Keeps one connection counted as open.
#[derive(Debug)]
pub struct ConnectionGuard {
    counts: Arc<Counts>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let open = self.counts.open.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_connections(open);
        if open == 0 {
            self.counts.idle.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, open, "Connection released");
    }
}
