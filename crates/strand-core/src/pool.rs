//! Named resource pools: priority-queued, cancellable semaphores with
//! per-pool metrics.
//!
//! Waiters are keyed `(Reverse(priority), seq)` in a `BTreeMap`, so the
//! highest priority is granted first, FIFO within a priority, and a
//! cancelled waiter is removed in O(log n). Releasing a slot hands it
//! directly to the best waiter, so there are no spurious wake-ups and
//! `active` never exceeds `capacity`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Capacity used for pools that are not explicitly configured.
pub const DEFAULT_POOL_CAPACITY: u32 = 8;

/// Errors from [`PoolManager::acquire`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool acquisition aborted")]
    Aborted,

    #[error("pool '{0}' is closed")]
    Closed(String),
}

/// Acquisition options: higher priority wins; the signal cancels the wait.
#[derive(Default)]
pub struct AcquireOptions {
    pub priority: i32,
    pub signal: Option<CancellationToken>,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    pub active: u32,
    pub queued: usize,
    pub capacity: u32,
    pub total_acquired: u64,
    pub total_wait_ms: u64,
}

type WaiterKey = (Reverse<i32>, u64);

struct Pool {
    capacity: u32,
    active: u32,
    next_seq: u64,
    waiters: BTreeMap<WaiterKey, oneshot::Sender<()>>,
    total_acquired: u64,
    total_wait_ms: u64,
    closed: bool,
}

impl Pool {
    fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            active: 0,
            next_seq: 0,
            waiters: BTreeMap::new(),
            total_acquired: 0,
            total_wait_ms: 0,
            closed: false,
        }
    }
}

struct ManagerInner {
    pools: HashMap<String, Pool>,
    default_capacity: u32,
}

impl ManagerInner {
    fn pool_mut(&mut self, name: &str) -> &mut Pool {
        let capacity = self.default_capacity;
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Pool::new(capacity))
    }
}

/// Process-wide pool registry.
///
/// Pools named in the workflow's `pools` map get their configured capacity;
/// any other name (including the per-step-type defaults) is created on first
/// use with the default capacity.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl PoolManager {
    pub fn new(pools: HashMap<String, u32>, default_capacity: u32) -> Self {
        let pools = pools
            .into_iter()
            .map(|(name, capacity)| (name, Pool::new(capacity)))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                pools,
                default_capacity: default_capacity.max(1),
            })),
        }
    }

    /// Register (or resize) a named pool. Active holders keep their slots;
    /// a shrink only affects future acquisitions.
    pub fn register(&self, name: &str, capacity: u32) {
        let mut inner = self.inner.lock().expect("pool lock");
        let capacity = capacity.max(1);
        inner
            .pools
            .entry(name.to_string())
            .and_modify(|pool| pool.capacity = capacity)
            .or_insert_with(|| Pool::new(capacity));
    }

    /// Acquire one slot from `name`. The returned permit releases on drop.
    pub async fn acquire(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> Result<PoolPermit, PoolError> {
        let started = Instant::now();
        let (key, mut rx) = {
            let mut inner = self.inner.lock().expect("pool lock");
            let pool = inner.pool_mut(name);
            if pool.closed {
                return Err(PoolError::Closed(name.to_string()));
            }
            if pool.active < pool.capacity && pool.waiters.is_empty() {
                pool.active += 1;
                pool.total_acquired += 1;
                return Ok(self.permit(name));
            }

            let (tx, rx) = oneshot::channel();
            let key = (Reverse(options.priority), pool.next_seq);
            pool.next_seq += 1;
            pool.waiters.insert(key, tx);
            (key, rx)
        };

        let signal = options.signal.unwrap_or_default();

        tokio::select! {
            biased;
            granted = &mut rx => match granted {
                Ok(()) => {
                    self.record_wait(name, started);
                    Ok(self.permit(name))
                }
                Err(_) => Err(PoolError::Closed(name.to_string())),
            },
            _ = signal.cancelled() => {
                let removed = {
                    let mut inner = self.inner.lock().expect("pool lock");
                    inner.pool_mut(name).waiters.remove(&key).is_some()
                };
                if removed {
                    return Err(PoolError::Aborted);
                }
                // The grant raced the cancellation: the slot is ours, take it
                // rather than leaking it.
                match rx.try_recv() {
                    Ok(()) => {
                        self.record_wait(name, started);
                        Ok(self.permit(name))
                    }
                    Err(_) => Err(PoolError::Aborted),
                }
            }
        }
    }

    /// Close a pool: reject waiters and refuse future acquisitions.
    /// Held permits still release cleanly.
    pub fn close(&self, name: &str) {
        let mut inner = self.inner.lock().expect("pool lock");
        let pool = inner.pool_mut(name);
        pool.closed = true;
        // Dropping the senders rejects every parked waiter.
        pool.waiters.clear();
    }

    /// Metrics for a pool (creating it if it does not exist yet).
    pub fn metrics(&self, name: &str) -> PoolMetrics {
        let mut inner = self.inner.lock().expect("pool lock");
        let pool = inner.pool_mut(name);
        PoolMetrics {
            active: pool.active,
            queued: pool.waiters.len(),
            capacity: pool.capacity,
            total_acquired: pool.total_acquired,
            total_wait_ms: pool.total_wait_ms,
        }
    }

    fn permit(&self, name: &str) -> PoolPermit {
        PoolPermit {
            manager: Arc::clone(&self.inner),
            pool: name.to_string(),
            released: false,
        }
    }

    fn record_wait(&self, name: &str, started: Instant) {
        let mut inner = self.inner.lock().expect("pool lock");
        let pool = inner.pool_mut(name);
        pool.total_wait_ms += started.elapsed().as_millis() as u64;
    }
}

/// A held pool slot. Dropping it releases the slot, handing it directly to
/// the best waiter when one is parked.
pub struct PoolPermit {
    manager: Arc<Mutex<ManagerInner>>,
    pool: String,
    released: bool,
}

impl std::fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPermit")
            .field("pool", &self.pool)
            .field("released", &self.released)
            .finish()
    }
}

impl PartialEq for PoolPermit {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.manager, &other.manager)
            && self.pool == other.pool
            && self.released == other.released
    }
}

impl PoolPermit {
    /// Release explicitly (drop does the same).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut inner = self.manager.lock().expect("pool lock");
        let pool = inner.pool_mut(&self.pool);

        // Hand the slot to the best waiter: highest priority first, FIFO
        // within a priority. A waiter whose receiver vanished (cancelled
        // between removal attempts) is skipped.
        while let Some((&key, _)) = pool.waiters.iter().next() {
            let tx = pool.waiters.remove(&key).expect("waiter present");
            if tx.send(()).is_ok() {
                pool.total_acquired += 1;
                return;
            }
        }
        pool.active = pool.active.saturating_sub(1);
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
