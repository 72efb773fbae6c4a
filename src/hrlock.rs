//! Single-writer hashed big-reader locks.
//!
//! Similar to a bytelock, but lock bytes are aggregated by reader to
//! minimise false sharing: each reader owns its own row of a shared table,
//! so no reader ever writes to a byte another reader writes.
//!
//! Each lock is just a 32 bit hash seed; the seed picks a column of a
//! `THREAD_LIMIT x HASH_BUCKETS` table of `{write_depth, read_depth}`
//! byte pairs and the reader's thread id picks the row. Multiple locks
//! hash onto the same column, which is only sound because a table has a
//! single writer for all locks backed by it.
//!
//! Two rules follow. There must be exactly one writer thread per table:
//! concurrent writers would interleave their column sweeps and corrupt
//! depths. And locks backed by the same table must not participate in any
//! ordering dependency: two of them can collide on a column and deadlock.
//! Layered locking is still fine across tables, for example one table per
//! object type.
//!
//! The constants keep false reader/writer conflicts around 1%. Write
//! acquisition walks the whole column and is slow on purpose; that is the
//! price of byte-cheap read acquisition.

use crate::{
    internal::{hook, md},
    thread::{self, THREAD_LIMIT},
};
use crossbeam_utils::Backoff;
use std::{
    fmt,
    sync::atomic::{
        fence, AtomicU32, AtomicU8,
        Ordering::{Acquire, Relaxed, Release, SeqCst},
    },
};

/// Columns per table. Must be a power of two.
pub const HASH_BUCKETS: usize = 128;

const _: () = assert!(HASH_BUCKETS.is_power_of_two());

/// Spin batch length between deadline checks on the slow path.
const SPIN_BATCH: usize = 128;

struct HrRecord {
    write_depth: AtomicU8,
    read_depth: AtomicU8,
}

/// The shared byte matrix backing a family of locks.
pub struct HrTable {
    records: [HrRecord; THREAD_LIMIT * HASH_BUCKETS],
}

impl HrTable {
    pub const fn new() -> Self {
        const R: HrRecord = HrRecord {
            write_depth: AtomicU8::new(0),
            read_depth: AtomicU8::new(0),
        };
        HrTable {
            records: [R; THREAD_LIMIT * HASH_BUCKETS],
        }
    }

    #[inline]
    fn record(&self, tid: usize, column: usize) -> &HrRecord {
        &self.records[tid * HASH_BUCKETS + column]
    }
}

impl Default for HrTable {
    fn default() -> Self {
        HrTable::new()
    }
}

impl fmt::Debug for HrTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("HrTable { .. }")
    }
}

/// One lock: a hash seed selecting its column.
#[derive(Debug)]
pub struct Hrlock {
    hash: AtomicU32,
}

impl Hrlock {
    /// A lock with a random column assignment.
    pub fn new() -> Self {
        Hrlock {
            hash: AtomicU32::new(rand::random()),
        }
    }

    /// A lock pinned to a known column. The all-column acquisitions use
    /// this to walk every bucket; it is also convenient in tests.
    pub const fn from_seed(seed: u32) -> Self {
        Hrlock {
            hash: AtomicU32::new(seed),
        }
    }

    #[inline]
    fn column(&self) -> usize {
        self.hash.load(Relaxed) as usize & (HASH_BUCKETS - 1)
    }
}

impl Default for Hrlock {
    fn default() -> Self {
        Hrlock::new()
    }
}

unsafe fn read_unlock_all_trampoline(table: *mut u8) {
    read_unlock_all(&*(table as *const HrTable))
}

#[inline]
fn table_tag(table: &HrTable) -> *mut u8 {
    table as *const HrTable as *mut u8
}

/// Acquires `lock` for reading, giving up after `timeout_us`
/// microseconds. `u64::MAX` waits forever; 0 never blocks.
pub fn read_lock_timeout(lock: &Hrlock, table: &HrTable, timeout_us: u64) -> bool {
    let tid = thread::current().id as usize;
    let record = table.record(tid, lock.column());

    let old_depth = record.read_depth.fetch_add(1, SeqCst);
    if likely!(old_depth == 0) {
        // Outermost reader on this column for this thread: the writer
        // may already be sweeping it.
        if unlikely!(record.write_depth.load(SeqCst) != 0) {
            if !read_lock_slow(record, timeout_us) {
                return false;
            }
        }
        fence(Acquire);
    }

    thread::push_cleanup(read_unlock_all_trampoline, table_tag(table));
    true
}

/// Acquires `lock` for reading, waiting as long as it takes.
#[inline]
pub fn read_lock(lock: &Hrlock, table: &HrTable) {
    let locked = read_lock_timeout(lock, table, u64::max_value());
    debug_assert!(locked, "unbounded read lock failed");
}

/// Either fully acquires the lock or leaves every byte untouched.
#[inline]
pub fn read_trylock(lock: &Hrlock, table: &HrTable) -> bool {
    read_lock_timeout(lock, table, 0)
}

#[inline(never)]
#[cold]
fn read_lock_slow(record: &HrRecord, timeout_us: u64) -> bool {
    // Back out before waiting so the writer's sweep can finish.
    record.read_depth.store(0, SeqCst);
    if timeout_us == 0 {
        return false;
    }

    let deadline = if timeout_us != u64::max_value() {
        Some(md::ticks().saturating_add(md::us_to_ticks(timeout_us).max(1)))
    } else {
        None
    };

    loop {
        'clear: loop {
            for _ in 0..SPIN_BATCH {
                if record.write_depth.load(SeqCst) == 0 {
                    break 'clear;
                }
                std::hint::spin_loop();
            }
            if let Some(deadline) = deadline {
                if md::ticks() > deadline {
                    return false;
                }
            }
        }

        record.read_depth.store(1, SeqCst);
        fence(SeqCst);
        if record.write_depth.load(SeqCst) == 0 {
            break;
        }
        record.read_depth.store(0, SeqCst);
    }

    true
}

/// Releases a read acquisition of `lock`.
pub fn read_unlock(lock: &Hrlock, table: &HrTable) {
    thread::pop_cleanup(read_unlock_all_trampoline, table_tag(table));

    let tid = thread::current().id as usize;
    let record = table.record(tid, lock.column());
    fence(Release);
    let old_depth = record.read_depth.load(Relaxed);
    debug_assert!(old_depth > 0, "read unlock without a read lock");
    record.read_depth.store(old_depth - 1, Relaxed);
}

static WRITE_POISON: u8 = 0;

#[inline]
fn write_poison_tag() -> *mut u8 {
    &WRITE_POISON as *const u8 as *mut u8
}

/// Acquires `lock` for writing: bumps the write depth in every row of the
/// column, then waits for every other thread's read depth to drain.
///
/// There must be exactly one writer thread per table.
pub fn write_lock(lock: &Hrlock, table: &HrTable) {
    if hook::WRITE_LOCKS.enabled() {
        write_lock_impl(lock, table);
    }
}

fn write_lock_impl(lock: &Hrlock, table: &HrTable) {
    let tid = thread::current().id as usize;
    let column = lock.column();

    let mut old_depth = 0;
    for row in 0..THREAD_LIMIT {
        let record = table.record(row, column);
        old_depth = record.write_depth.load(Relaxed);
        record.write_depth.store(old_depth + 1, Relaxed);
    }

    // Reentrant acquisition through a colliding lock: the column is
    // already drained.
    if unlikely!(old_depth > 0) {
        thread::push_poison(write_poison_tag());
        return;
    }

    fence(SeqCst);
    for row in 0..THREAD_LIMIT {
        if row == tid {
            continue;
        }
        let record = table.record(row, column);
        let backoff = Backoff::new();
        while record.read_depth.load(SeqCst) != 0 {
            backoff.snooze();
        }
    }

    thread::push_poison(write_poison_tag());
}

/// Releases a write acquisition of `lock`.
pub fn write_unlock(lock: &Hrlock, table: &HrTable) {
    if hook::WRITE_LOCKS.enabled() {
        write_unlock_impl(lock, table);
    }
}

fn write_unlock_impl(lock: &Hrlock, table: &HrTable) {
    let column = lock.column();
    fence(Release);
    thread::pop_poison(write_poison_tag());
    for row in 0..THREAD_LIMIT {
        let record = table.record(row, column);
        let old_depth = record.write_depth.load(Relaxed);
        debug_assert!(old_depth > 0, "write unlock without a write lock");
        record.write_depth.store(old_depth - 1, Relaxed);
    }
}

fn read_maybe_lock_all(table: &HrTable, timeout_us: u64) -> usize {
    for column in 0..HASH_BUCKETS {
        let lock = Hrlock::from_seed(column as u32);
        if !read_lock_timeout(&lock, table, timeout_us) {
            return column;
        }
        // One cleanup record covers the whole sweep; drop the per-column
        // ones as we go.
        thread::pop_cleanup(read_unlock_all_trampoline, table_tag(table));
    }
    HASH_BUCKETS
}

/// Read locks every column of the table.
pub fn read_lock_all(table: &HrTable) {
    let locked = read_maybe_lock_all(table, u64::max_value());
    debug_assert_eq!(locked, HASH_BUCKETS);
}

/// Attempts to read lock every column; on failure nothing stays held.
pub fn read_trylock_all(table: &HrTable) -> bool {
    let tid = thread::current().id as usize;
    let locked = read_maybe_lock_all(table, 0);
    if locked == HASH_BUCKETS {
        return true;
    }

    for column in 0..locked {
        table.record(tid, column).read_depth.store(0, SeqCst);
    }
    false
}

/// Releases every column of the table for this thread.
pub fn read_unlock_all(table: &HrTable) {
    let tid = thread::current().id as usize;
    for column in 0..HASH_BUCKETS {
        table.record(tid, column).read_depth.store(0, SeqCst);
    }
    fence(Release);
}
