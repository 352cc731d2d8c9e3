//! Worker pools per FastCGI rule.
//!
//! # Responsibilities
//! - Cap live upstream connections per target address
//! - Hand out idle workers first, then open new slots round-robin
//! - Queue callers FIFO while every slot is busy
//! - Close workers whose exchange failed before they are reused
//!
//! # Design Decisions
//! - A fair semaphore with `targets × cap` permits is the wait queue
//! - Pool bookkeeping sits behind a mutex that is never held across an await
//! - Slots are never freed; a failed worker keeps its slot and reconnects

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::fastcgi::worker::Worker;
use crate::fastcgi::FastCgiError;
use crate::observability::metrics;
use crate::routing::rules::RuleId;

/// Upstream address of a FastCGI application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `host:port` or `[v6]:port`.
pub fn parse_target(raw: &str) -> Option<Target> {
    let (host, port) = raw.trim().rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    Some(Target {
        host: host.to_string(),
        port,
    })
}

#[derive(Debug)]
struct Slot {
    target: Target,
    live: usize,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    offset: usize,
    idle: VecDeque<Worker>,
}

/// Connection pool for one FastCGI rule.
#[derive(Debug)]
pub struct Dispatcher {
    label: String,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    max_per_target: usize,
    connect_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        label: impl Into<String>,
        targets: Vec<Target>,
        max_per_target: usize,
        connect_timeout: Duration,
    ) -> Self {
        let max_per_target = max_per_target.max(1);
        let slots: Vec<Slot> = targets
            .into_iter()
            .map(|target| Slot { target, live: 0 })
            .collect();
        Self {
            label: label.into(),
            permits: Arc::new(Semaphore::new(slots.len() * max_per_target)),
            state: Mutex::new(PoolState {
                slots,
                offset: 0,
                idle: VecDeque::new(),
            }),
            max_per_target,
            connect_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a worker.
    ///
    /// Callers blocked on a saturated pool are served in arrival order.
    pub async fn acquire(self: &Arc<Self>) -> Result<WorkerLease, FastCgiError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| FastCgiError::PoolClosed)?;
        let worker = self.take_or_create()?;
        tracing::trace!(
            rule = %self.label,
            upstream = %worker.target(),
            request_id = worker.request_id(),
            "FastCGI worker acquired"
        );
        Ok(WorkerLease {
            worker: Some(worker),
            dispatcher: Arc::clone(self),
            _permit: permit,
        })
    }

    fn take_or_create(&self) -> Result<Worker, FastCgiError> {
        let mut state = self.lock();
        if let Some(worker) = state.idle.pop_front() {
            return Ok(worker);
        }
        // A held permit guarantees a slot below its cap exists.
        let len = state.slots.len();
        for step in 0..len {
            let index = (state.offset + step) % len;
            let slot = &mut state.slots[index];
            if slot.live < self.max_per_target {
                slot.live += 1;
                let request_id = slot.live as u16;
                let worker = Worker::new(slot.target.clone(), request_id, self.connect_timeout);
                state.offset = (index + 1) % len;
                let live: usize = state.slots.iter().map(|s| s.live).sum();
                metrics::set_fastcgi_workers(&self.label, live);
                return Ok(worker);
            }
        }
        Err(FastCgiError::PoolClosed)
    }

    fn release(&self, mut worker: Worker) {
        if worker.in_flight() {
            worker.close();
        }
        self.lock().idle.push_back(worker);
    }

    /// Live workers per target, in configuration order.
    pub fn live_counts(&self) -> Vec<usize> {
        self.lock().slots.iter().map(|s| s.live).collect()
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Exclusive use of a worker.
///
/// Dropping the lease returns the worker to the pool. A worker whose
/// exchange did not reach END_REQUEST is closed first. The permit is
/// released only after the worker is back in the idle queue.
pub struct WorkerLease {
    worker: Option<Worker>,
    dispatcher: Arc<Dispatcher>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for WorkerLease {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        match &self.worker {
            Some(worker) => worker,
            None => unreachable!("worker is present until drop"),
        }
    }
}

impl DerefMut for WorkerLease {
    fn deref_mut(&mut self) -> &mut Worker {
        match &mut self.worker {
            Some(worker) => worker,
            None => unreachable!("worker is present until drop"),
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.dispatcher.release(worker);
        }
    }
}

/// Process-wide dispatchers, one per FastCGI rule.
#[derive(Debug)]
pub struct DispatcherRegistry {
    dispatchers: DashMap<RuleId, Arc<Dispatcher>>,
    max_per_target: usize,
    connect_timeout: Duration,
}

impl DispatcherRegistry {
    pub fn new(max_per_target: usize, connect_timeout: Duration) -> Self {
        Self {
            dispatchers: DashMap::new(),
            max_per_target,
            connect_timeout,
        }
    }

    /// Dispatcher for `rule`, created on first use.
    pub fn get(&self, rule: RuleId, targets: &[Target]) -> Arc<Dispatcher> {
        self.dispatchers
            .entry(rule)
            .or_insert_with(|| {
                tracing::debug!(rule = %rule, targets = targets.len(), "Creating FastCGI dispatcher");
                Arc::new(Dispatcher::new(
                    rule.to_string(),
                    targets.to_vec(),
                    self.max_per_target,
                    self.connect_timeout,
                ))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: u16) -> Vec<Target> {
        (0..n)
            .map(|i| Target {
                host: "127.0.0.1".into(),
                port: 9000 + i,
            })
            .collect()
    }

    fn dispatcher(n: u16, cap: usize) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new("test", targets(n), cap, Duration::from_secs(1)))
    }

    #[test]
    fn parses_targets() {
        assert_eq!(
            parse_target("127.0.0.1:9000"),
            Some(Target { host: "127.0.0.1".into(), port: 9000 })
        );
        assert_eq!(
            parse_target("[::1]:9000"),
            Some(Target { host: "::1".into(), port: 9000 })
        );
        assert_eq!(parse_target("localhost"), None);
        assert_eq!(parse_target(":9000"), None);
        assert_eq!(parse_target("host:0"), None);
        assert_eq!(parse_target("host:port"), None);
        assert_eq!(parse_target("[::1]:9000").unwrap().to_string(), "[::1]:9000");
    }

    #[tokio::test]
    async fn new_slots_rotate_across_targets() {
        let pool = dispatcher(2, 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(a.target().port, 9000);
        assert_eq!(b.target().port, 9001);
        assert_eq!(c.target().port, 9000);
        assert_eq!((a.request_id(), b.request_id(), c.request_id()), (1, 1, 2));
        assert_eq!(pool.live_counts(), vec![2, 1]);
    }

    #[tokio::test]
    async fn idle_workers_are_reused_first() {
        let pool = dispatcher(2, 1);
        let first = pool.acquire().await.unwrap();
        let port = first.target().port;
        drop(first);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.target().port, port);
        assert_eq!(pool.live_counts(), vec![1, 0]);
    }

    #[tokio::test]
    async fn saturated_pool_waits_in_arrival_order() {
        let pool = dispatcher(1, 1);
        let held = pool.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for i in 0..3 {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                tx.send(i).unwrap();
                drop(lease);
            }));
            // Let each waiter enqueue before spawning the next.
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        assert!(rx.try_recv().is_err());

        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        let order: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(pool.live_counts(), vec![1]);
    }

    #[tokio::test]
    async fn registry_reuses_dispatchers_per_rule() {
        let registry = DispatcherRegistry::new(1, Duration::from_secs(1));
        let a = registry.get(RuleId(0), &targets(1));
        let b = registry.get(RuleId(0), &targets(1));
        let c = registry.get(RuleId(1), &targets(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }
}
