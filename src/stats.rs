//! Process wide counters.
//!
//! Cheap always-on counters for the pool allocator and the reclamation
//! service. Everything here is monotone or owner-updated, so plain relaxed
//! atomics are enough; snapshots are advisory.

use crate::thread::THREAD_LIMIT;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

pub(crate) struct PoolCounters {
    pub epochs_open: AtomicU64,
    pub epochs_created: AtomicU64,
    pub epochs_destroyed: AtomicU64,
    pub pool_allocations: AtomicU64,
    pub pool_allocated_bytes: AtomicU64,
    pub system_allocations: AtomicU64,
    pub transactions_total: AtomicU64,
    pub max_transactions_per_epoch: AtomicU64,
}

static POOL: PoolCounters = PoolCounters {
    epochs_open: AtomicU64::new(0),
    epochs_created: AtomicU64::new(0),
    epochs_destroyed: AtomicU64::new(0),
    pool_allocations: AtomicU64::new(0),
    pool_allocated_bytes: AtomicU64::new(0),
    system_allocations: AtomicU64::new(0),
    transactions_total: AtomicU64::new(0),
    max_transactions_per_epoch: AtomicU64::new(0),
};

#[inline]
pub(crate) fn pool() -> &'static PoolCounters {
    &POOL
}

impl PoolCounters {
    /// Racy max update; the counter is advisory.
    pub(crate) fn observe_epoch_transactions(&self, transactions: u64) {
        if transactions > self.max_transactions_per_epoch.load(Relaxed) {
            self.max_transactions_per_epoch.store(transactions, Relaxed);
        }
    }
}

/// Pool allocator snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub epochs_open: u64,
    pub epochs_created: u64,
    pub epochs_destroyed: u64,
    pub pool_allocations: u64,
    pub pool_allocated_bytes: u64,
    pub system_allocations: u64,
    pub transactions_total: u64,
    pub max_transactions_per_epoch: u64,
}

pub fn pool_stats() -> PoolStats {
    PoolStats {
        epochs_open: POOL.epochs_open.load(Relaxed),
        epochs_created: POOL.epochs_created.load(Relaxed),
        epochs_destroyed: POOL.epochs_destroyed.load(Relaxed),
        pool_allocations: POOL.pool_allocations.load(Relaxed),
        pool_allocated_bytes: POOL.pool_allocated_bytes.load(Relaxed),
        system_allocations: POOL.system_allocations.load(Relaxed),
        transactions_total: POOL.transactions_total.load(Relaxed),
        max_transactions_per_epoch: POOL.max_transactions_per_epoch.load(Relaxed),
    }
}

pub(crate) struct SmrCounters {
    pub pending: AtomicU64,
    pub peak: AtomicU64,
    pub reclamations: AtomicU64,
}

static SMR: [SmrCounters; THREAD_LIMIT] = {
    const S: SmrCounters = SmrCounters {
        pending: AtomicU64::new(0),
        peak: AtomicU64::new(0),
        reclamations: AtomicU64::new(0),
    };
    [S; THREAD_LIMIT]
};

#[inline]
pub(crate) fn smr(id: usize) -> &'static SmrCounters {
    &SMR[id]
}

/// Reclamation snapshot for one thread slot.
#[derive(Debug, Clone, Copy)]
pub struct SmrStats {
    pub pending: u64,
    pub peak: u64,
    pub reclamations: u64,
}

pub fn smr_stats(id: u32) -> SmrStats {
    let counters = smr(id as usize);
    SmrStats {
        pending: counters.pending.load(Relaxed),
        peak: counters.peak.load(Relaxed),
        reclamations: counters.reclamations.load(Relaxed),
    }
}
