//! Safe memory reclamation.
//!
//! Readers bracket their work in sections; destruction of anything a
//! section could still reference is deferred through a per-thread pending
//! table and dispatched only once every registered thread has quiesced past
//! the point where the table was shipped.
//!
//! The pending table is keyed by pointer identity, which buys double free
//! detection for free: a second deferral of the same address is dropped and
//! logged instead of corrupting the heap later. Shipping the table seals it
//! with a fresh tick of the epoch clock and starts a new empty table;
//! [`poll`] dispatches sealed tables opportunistically and [`synchronize`]
//! blocks until all of them drain.

use crate::{
    internal::quiesce::{QuiesceEpoch, CLOCK},
    stats,
    thread::{self, CleanupFn, Thread, THREAD_LIMIT},
    token::Token,
};
use fxhash::FxHashMap;
use std::{
    cell::{Cell, RefCell},
    collections::{hash_map::Entry, VecDeque},
    sync::atomic::Ordering::{Acquire, Relaxed, Release},
};

/// Initial capacity of a fresh pending table.
const PENDING_TABLE_CAPACITY: usize = 128;

/// Sections are expected to nest inside recoverable scopes, so each open
/// section leaves a cleanup record that closes it on unwind.
const SECTIONS_ONLY_NESTED: bool = true;

enum Deferred {
    Call(CleanupFn),
    /// Route the pointer back to the typed allocator on dispatch.
    Free(Token),
}

type PendingMap = FxHashMap<usize, Deferred>;

struct SealedTable {
    epoch: QuiesceEpoch,
    map: PendingMap,
}

fn fresh_map() -> PendingMap {
    PendingMap::with_capacity_and_hasher(PENDING_TABLE_CAPACITY, Default::default())
}

/// Per-thread reclamation state, reachable through the thread registry.
pub(crate) struct SmrLocal {
    depth: Cell<u32>,
    pause_depth: Cell<u32>,
    pending: RefCell<PendingMap>,
    sealed: RefCell<VecDeque<SealedTable>>,
}

impl Default for SmrLocal {
    fn default() -> Self {
        SmrLocal {
            depth: Cell::new(0),
            pause_depth: Cell::new(0),
            pending: RefCell::new(fresh_map()),
            sealed: RefCell::new(VecDeque::new()),
        }
    }
}

impl SmrLocal {
    #[inline]
    pub(crate) fn in_section(&self) -> bool {
        self.depth.get() > 0
    }
}

/// A reader critical section. Sections nest; only the outermost one pins
/// the thread's quiescence epoch.
#[derive(Debug, Default)]
pub struct Section {
    armed: bool,
}

impl Section {
    pub fn new() -> Self {
        Section { armed: false }
    }
}

unsafe fn end_trampoline(section: *mut u8) {
    end_impl(&mut *(section as *mut Section))
}

/// Opens a section. While any section is active on this thread, deferred
/// callbacks queued anywhere in the process may not reclaim state this
/// thread could still read.
pub fn begin(section: &mut Section) {
    let thread = thread::current();
    assert!(!section.armed, "section opened twice");
    section.armed = true;

    let depth = thread.smr.depth.get();
    if depth == 0 {
        thread::shared(thread.id as usize)
            .epoch
            .pin(CLOCK.now(), Release);
    }
    thread.smr.depth.set(depth + 1);

    if SECTIONS_ONLY_NESTED {
        thread::push_cleanup(end_trampoline, section as *mut Section as *mut u8);
    }
}

/// Closes a section opened by [`begin`]. Must pair with it exactly.
pub fn end(section: &mut Section) {
    if SECTIONS_ONLY_NESTED {
        thread::pop_cleanup(end_trampoline, section as *mut Section as *mut u8);
    }
    end_impl(section)
}

fn end_impl(section: &mut Section) {
    let thread = thread::current();
    assert!(section.armed, "section closed twice");
    section.armed = false;

    let depth = thread.smr.depth.get();
    assert!(depth > 0, "section underflow");
    thread.smr.depth.set(depth - 1);
    if depth == 1 {
        thread::shared(thread.id as usize).epoch.unpin(Release);
    }
}

/// True while the slot's owner is inside a section (or collecting). Used
/// by the commit barrier to decide whether a thread can still observe
/// published state.
#[inline]
pub(crate) fn record_is_active(id: usize) -> bool {
    thread::is_registered(id) && thread::shared(id).epoch.is_active(Acquire)
}

fn insert(thread: &Thread, key: usize, deferred: Deferred) {
    let mut pending = thread.smr.pending.borrow_mut();
    match pending.entry(key) {
        Entry::Occupied(_) => {
            // Keep the first callback; the duplicate is a likely double
            // free in the caller.
            log::error!("double deferred free detected on address {:#x}", key);
        }
        Entry::Vacant(slot) => {
            slot.insert(deferred);
            stats::smr(thread.id as usize).pending.fetch_add(1, Relaxed);
        }
    }
}

/// Defers `cb(ptr)` until every section active anywhere in the process has
/// closed. The two distinguished values (null and all-ones) are invoked
/// immediately.
///
/// # Safety
///
/// `cb` must remain sound to call with `ptr` at any later point on this
/// thread.
pub unsafe fn call(ptr: *mut u8, cb: CleanupFn) {
    if ptr.is_null() || ptr as usize == !0 {
        cb(ptr);
        return;
    }
    insert(&thread::current(), ptr as usize, Deferred::Call(cb));
}

/// Like [`call`], but dispatch frees the pointer through the typed
/// allocator instead of an arbitrary callback. The distinguished values
/// are ignored.
///
/// # Safety
///
/// `ptr` must have been allocated under `token`.
pub unsafe fn free_by_token(token: Token, ptr: *mut u8) {
    if ptr.is_null() || ptr as usize == !0 {
        return;
    }
    insert(&thread::current(), ptr as usize, Deferred::Free(token));
}

/// Lossy probe: true means `ptr` is queued for destruction on this thread.
/// False means it may or may not be.
pub fn pending_destruction(ptr: *const u8) -> bool {
    let thread = thread::current();
    let pending = thread.smr.pending.borrow();
    pending.contains_key(&(ptr as usize))
}

fn ship(thread: &Thread) {
    let map = {
        let mut pending = thread.smr.pending.borrow_mut();
        if pending.is_empty() {
            return;
        }
        std::mem::replace(&mut *pending, fresh_map())
    };
    let epoch = CLOCK.fetch_and_tick();
    thread
        .smr
        .sealed
        .borrow_mut()
        .push_back(SealedTable { epoch, map });
}

fn min_active_epoch() -> QuiesceEpoch {
    let mut min = QuiesceEpoch::max_value();
    for id in 0..THREAD_LIMIT {
        if !thread::is_registered(id) {
            continue;
        }
        min = min.min(thread::shared(id).epoch.get(Acquire));
    }
    min
}

fn wait_for(epoch: QuiesceEpoch) {
    for id in 0..THREAD_LIMIT {
        if !thread::is_registered(id) {
            continue;
        }
        let record = &thread::shared(id).epoch;
        if !record.is_quiesced(epoch, Acquire) {
            record.wait_until_quiesced(epoch);
        }
    }
}

fn dispatch(thread: &Thread, table: SealedTable) {
    let shared = thread::shared(thread.id as usize);
    let counters = stats::smr(thread.id as usize);

    // Dispatch runs destructors that may themselves read shared state, so
    // the dispatching thread counts as active for its duration.
    let was_inactive = !shared.epoch.is_active(Relaxed);
    if was_inactive {
        shared.epoch.pin_collect(Release);
    }

    let pending_now = counters.pending.load(Relaxed);
    if pending_now > counters.peak.load(Relaxed) {
        counters.peak.store(pending_now, Relaxed);
    }

    let mut dispatched = 0u64;
    for (ptr, deferred) in table.map {
        match deferred {
            Deferred::Call(cb) => unsafe { cb(ptr as *mut u8) },
            Deferred::Free(token) => unsafe { crate::pool::free(token, ptr as *mut u8) },
        }
        dispatched += 1;
    }
    counters.pending.fetch_sub(dispatched, Relaxed);
    counters.reclamations.fetch_add(dispatched, Relaxed);

    if was_inactive {
        shared.epoch.unpin(Release);
    }
}

fn collect(thread: &Thread, block: bool) -> bool {
    loop {
        let front_epoch = match thread.smr.sealed.borrow().front() {
            Some(table) => table.epoch,
            None => return true,
        };

        if min_active_epoch() <= front_epoch {
            if !block {
                return false;
            }
            wait_for(front_epoch);
        }

        let table = thread
            .smr
            .sealed
            .borrow_mut()
            .pop_front()
            .expect("sealed queue changed under its owner");
        dispatch(thread, table);
    }
}

/// Ships the pending table and dispatches whatever has quiesced. Returns
/// true when no shipped table remains. A paused thread logs and returns
/// false without shipping.
pub fn poll() -> bool {
    let thread = thread::current();
    if thread.smr.pause_depth.get() > 0 {
        log::warn!(
            "skipping reclamation poll, pause depth {}",
            thread.smr.pause_depth.get()
        );
        return false;
    }

    ship(&thread);
    collect(&thread, false)
}

/// Ships the pending table and blocks until every shipped table is
/// reclaimed. Must be called outside any section. Also retires the
/// calling thread's fully closed pool arenas, since synchronize is a
/// quiescent point by definition.
pub fn synchronize() {
    let thread = thread::current();
    if thread.smr.pause_depth.get() > 0 {
        log::warn!(
            "skipping synchronize, pause depth {}",
            thread.smr.pause_depth.get()
        );
        return;
    }
    assert!(
        !thread.smr.in_section(),
        "synchronize called from inside a section"
    );

    crate::pool::reclaim_transactions(&thread);
    ship(&thread);
    let _ = collect(&thread, true);
}

/// Pauses reclamation for this thread; [`poll`] becomes a logged no-op.
pub fn pause() {
    let thread = thread::current();
    thread.smr.pause_depth.set(thread.smr.pause_depth.get() + 1);
}

/// Undoes one [`pause`]. Resuming to depth zero polls immediately.
pub fn resume() {
    let thread = thread::current();
    let depth = thread.smr.pause_depth.get();
    assert!(depth > 0, "resume without a matching pause");
    thread.smr.pause_depth.set(depth - 1);
    if depth == 1 {
        drop(thread);
        let _ = poll();
    }
}

/// Current pause depth for this thread.
pub fn pause_depth() -> usize {
    thread::current().smr.pause_depth.get() as usize
}

/// Flushes everything this thread still owes before its slot is released.
pub(crate) fn flush_on_deregister(thread: &Thread) {
    assert!(
        !thread.smr.in_section(),
        "deregistering inside a section"
    );
    assert_eq!(
        thread.smr.pause_depth.get(),
        0,
        "deregistering while reclamation is paused"
    );
    ship(thread);
    let _ = collect(thread, true);
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed as R};

    fn on_worker(f: impl FnOnce() + Send) {
        let _serial = crate::test_util::serial();
        crossbeam_utils::thread::scope(|s| {
            s.spawn(|_| {
                let handle = thread::register(false).unwrap();
                f();
                thread::deregister(handle);
            })
            .join()
            .unwrap();
        })
        .unwrap()
    }

    #[test]
    fn deferred_call_runs_after_poll() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        unsafe fn cb(_: *mut u8) {
            RAN.fetch_add(1, R);
        }

        on_worker(|| {
            RAN.store(0, R);
            let target = 0x1000usize as *mut u8;
            unsafe { call(target, cb) };
            assert!(pending_destruction(target as *const u8));
            assert_eq!(RAN.load(R), 0);
            assert!(poll());
            assert_eq!(RAN.load(R), 1);
        });
    }

    #[test]
    fn sentinels_run_immediately() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        unsafe fn cb(_: *mut u8) {
            RAN.fetch_add(1, R);
        }

        on_worker(|| {
            RAN.store(0, R);
            unsafe {
                call(std::ptr::null_mut(), cb);
                call(!0usize as *mut u8, cb);
            }
            assert_eq!(RAN.load(R), 2);
        });
    }

    #[test]
    fn double_call_keeps_first_callback() {
        static FIRST: AtomicUsize = AtomicUsize::new(0);
        static SECOND: AtomicUsize = AtomicUsize::new(0);
        unsafe fn first(_: *mut u8) {
            FIRST.fetch_add(1, R);
        }
        unsafe fn second(_: *mut u8) {
            SECOND.fetch_add(1, R);
        }

        on_worker(|| {
            FIRST.store(0, R);
            SECOND.store(0, R);
            let target = 0x2000usize as *mut u8;
            unsafe {
                call(target, first);
                call(target, second);
            }
            assert!(poll());
            assert_eq!(FIRST.load(R), 1);
            assert_eq!(SECOND.load(R), 0, "duplicate deferral must be dropped");
        });
    }

    #[test]
    fn paused_poll_noops() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        unsafe fn cb(_: *mut u8) {
            RAN.fetch_add(1, R);
        }

        on_worker(|| {
            RAN.store(0, R);
            pause();
            assert_eq!(pause_depth(), 1);
            unsafe { call(0x3000usize as *mut u8, cb) };
            assert!(!poll());
            assert_eq!(RAN.load(R), 0);
            // Resume to zero triggers the implicit poll.
            resume();
            assert_eq!(pause_depth(), 0);
            assert_eq!(RAN.load(R), 1);
        });
    }

    #[test]
    fn sections_nest_and_pin() {
        on_worker(|| {
            let id = thread::current_id().unwrap() as usize;
            assert!(!record_is_active(id));

            let mut outer = Section::new();
            let mut inner = Section::new();
            begin(&mut outer);
            assert!(record_is_active(id));
            begin(&mut inner);
            end(&mut inner);
            assert!(record_is_active(id), "outer section still pins");
            end(&mut outer);
            assert!(!record_is_active(id));
        });
    }

    #[test]
    fn synchronize_drains() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        unsafe fn cb(_: *mut u8) {
            RAN.fetch_add(1, R);
        }

        on_worker(|| {
            RAN.store(0, R);
            for i in 0..10 {
                unsafe { call((0x4000 + i * 16) as *mut u8, cb) };
            }
            synchronize();
            assert_eq!(RAN.load(R), 10);
        });
    }
}
