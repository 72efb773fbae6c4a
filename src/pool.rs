//! Transactional pool allocator.
//!
//! Allocation on the request path is served from per-thread bump arenas.
//! An arena is a 32 MiB region, 1 MiB aligned, whose header carries a
//! reference count of the open transactions created while it was the
//! newest arena. Transactions never free individual objects; closing the
//! last transaction on the oldest arena lets the whole region be destroyed
//! on the owning thread's next allocation path, oldest first.
//!
//! All pool operations touch per-thread state only. The process-wide
//! ownership bitmap is written when arenas or large allocations are
//! created and destroyed, off the allocation hot path, and its regions are
//! disjoint because arenas are disjoint and granule aligned.
//!
//! Requests at or above the large threshold escape to the system
//! allocator with arena alignment, get their base granule marked in the
//! ownership bitmap, and are tied to the enclosing arena through a cleanup
//! record, so their lifetime still ends with the transaction's arena.

use crate::{
    internal::bitmap,
    stats,
    thread::{self, CleanupFn, Thread},
    token::{self, Mode, Token, TypeDecl},
};
use cfg_if::cfg_if;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{
        AtomicU64, AtomicUsize,
        Ordering::{Acquire, Relaxed, Release},
    },
    time::{SystemTime, UNIX_EPOCH},
};

pub const EPOCH_SIZE: usize = 1 << 25;
pub const EPOCH_ALIGNMENT: usize = 1 << 20;
pub const ZERO_GRANULARITY: usize = 1 << 12;
pub const LARGE_ALLOC_THRESHOLD: usize = 1 << 22;

/// Minimal alignment of every pool or system allocation.
pub const GUARANTEED_ALIGNMENT: usize = 16;

const fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

const EPOCH_HEADER_SIZE: usize = round_up(mem::size_of::<Epoch>(), GUARANTEED_ALIGNMENT);

/// Usable bytes per arena.
pub const EPOCH_AVAILABLE_SIZE: usize = EPOCH_SIZE - EPOCH_HEADER_SIZE;

const _: () = assert!(EPOCH_SIZE % EPOCH_ALIGNMENT == 0);
const _: () = assert!(EPOCH_ALIGNMENT == bitmap::GRANULE);
const _: () = assert!(LARGE_ALLOC_THRESHOLD <= EPOCH_AVAILABLE_SIZE);
const _: () = assert!(ZERO_GRANULARITY.is_power_of_two());

/// How many destroyed arenas each thread caches for reuse. Zero disables
/// the cache.
static RECLAIMED_EPOCHS_LIMIT: AtomicUsize = AtomicUsize::new(8);

pub fn set_reclaimed_epochs_limit(limit: usize) {
    RECLAIMED_EPOCHS_LIMIT.store(limit, Relaxed);
}

lazy_static::lazy_static! {
    static ref EPOCH_TOKEN: Token = token::register(&TypeDecl {
        name: "pool:arena",
        mode: Mode::Variable,
        pool_eligible: false,
    });
    static ref LARGE_TOKEN: Token = token::register(&TypeDecl {
        name: "pool:large_alloc",
        mode: Mode::Variable,
        pool_eligible: false,
    });
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Bytes actually reserved for an allocation, for accounting of
        /// variable size types.
        fn allocation_size(_requested: usize, ptr: *mut u8) -> usize {
            unsafe { libc::malloc_usable_size(ptr as *mut libc::c_void) }
        }
    } else {
        fn allocation_size(requested: usize, _ptr: *mut u8) -> usize {
            requested
        }
    }
}

/// Arena header, stored at the base of the region; the pool proper starts
/// at `EPOCH_HEADER_SIZE`.
#[repr(C)]
pub(crate) struct Epoch {
    /// Bump offset from the region base.
    offset: Cell<usize>,
    allocations: Cell<u64>,
    allocated_bytes: Cell<u64>,
    created_at: Cell<u64>,
    /// Transactions created while this was the newest arena, lifetime.
    transactions_created: Cell<u64>,
    /// Transactions created while this was the newest arena, still open.
    /// The only field touched from other threads.
    ref_count: AtomicU64,
    cleanups: Cell<Option<NonNull<EpochCleanup>>>,
}

#[repr(C)]
struct EpochCleanup {
    cb: CleanupFn,
    arg: *mut u8,
    next: Option<NonNull<EpochCleanup>>,
}

/// Opaque transaction handle: the arena that was newest at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochRef(NonNull<Epoch>);

// Closing a transaction from another thread only touches the atomic
// reference count.
unsafe impl Send for EpochRef {}

impl EpochRef {
    #[inline]
    fn header(&self) -> &Epoch {
        unsafe { self.0.as_ref() }
    }

    /// Open transactions whose creation arena is this one.
    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.header().ref_count.load(Relaxed)
    }
}

/// Per-thread pool allocation policy.
///
/// Allocation uses the pool iff the type opted in and both booleans are
/// set: `pool_enabled` says the thread uses pool allocation at all,
/// `pool_allowed` says the current call stack may.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MallocState {
    pub pool_enabled: bool,
    pub pool_allowed: bool,
}

/// Per-thread arena queues.
pub(crate) struct PoolLocal {
    /// Oldest first; only the front may be destroyed, the back is the
    /// bump target.
    open: RefCell<VecDeque<NonNull<Epoch>>>,
    reclaimed: RefCell<Vec<NonNull<Epoch>>>,
}

impl Default for PoolLocal {
    fn default() -> Self {
        PoolLocal {
            open: RefCell::new(VecDeque::new()),
            reclaimed: RefCell::new(Vec::new()),
        }
    }
}

/// Saved state returned by [`pool_open`], consumed by [`pool_close`].
#[derive(Debug)]
pub struct PoolScope {
    state: MallocState,
    epoch: EpochRef,
}

impl PoolScope {
    #[inline]
    pub fn epoch(&self) -> EpochRef {
        self.epoch
    }
}

/// Optional per-call keywords.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    /// Bypass the pool even for eligible types.
    pub non_pool: bool,
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Arena create and destroy. Not on the allocation hot path.

fn epoch_create(thread: &Thread) -> NonNull<Epoch> {
    let region = match thread.pool.reclaimed.borrow_mut().pop() {
        Some(cached) => cached,
        None => {
            let mut raw: *mut libc::c_void = ptr::null_mut();
            let rc = unsafe { libc::posix_memalign(&mut raw, EPOCH_ALIGNMENT, EPOCH_SIZE) };
            assert!(rc == 0 && !raw.is_null(), "posix_memalign failed for a new arena");
            bitmap::set(raw as usize, EPOCH_SIZE);
            token::account(*EPOCH_TOKEN, EPOCH_SIZE as i64, 1);
            NonNull::new(raw as *mut Epoch).expect("posix_memalign returned null")
        }
    };

    unsafe {
        // Zero through the first granule so the invariant "bytes past the
        // bump offset within the current chunk are zero" holds from the
        // start.
        let zeroed = round_up(EPOCH_HEADER_SIZE, ZERO_GRANULARITY).min(EPOCH_SIZE);
        ptr::write_bytes(region.as_ptr() as *mut u8, 0, zeroed);
        region.as_ptr().write(Epoch {
            offset: Cell::new(EPOCH_HEADER_SIZE),
            allocations: Cell::new(0),
            allocated_bytes: Cell::new(0),
            created_at: Cell::new(now_seconds()),
            transactions_created: Cell::new(0),
            ref_count: AtomicU64::new(0),
            cleanups: Cell::new(None),
        });
    }

    let counters = stats::pool();
    counters.epochs_open.fetch_add(1, Relaxed);
    counters.epochs_created.fetch_add(1, Relaxed);

    thread.pool.open.borrow_mut().push_back(region);
    region
}

unsafe fn run_epoch_cleanups(header: &Epoch) {
    while let Some(record) = header.cleanups.get() {
        let record = record.as_ref();
        header.cleanups.set(record.next);
        (record.cb)(record.arg);
    }
}

fn epoch_destroy(thread: &Thread, epoch: NonNull<Epoch>) {
    let header = unsafe { epoch.as_ref() };

    // Cleanups may free large allocations whose ownership bits must still
    // be set, so they run before the region is released; they also must
    // not allocate back into the dying arena, so the pool policy is
    // cleared around them.
    let saved = thread.malloc_state.replace(MallocState::default());
    unsafe { run_epoch_cleanups(header) };
    thread.malloc_state.set(saved);

    let counters = stats::pool();
    counters.epochs_open.fetch_sub(1, Relaxed);
    counters.epochs_destroyed.fetch_add(1, Relaxed);
    counters
        .pool_allocations
        .fetch_add(header.allocations.get(), Relaxed);
    counters
        .pool_allocated_bytes
        .fetch_add(header.allocated_bytes.get(), Relaxed);
    counters
        .transactions_total
        .fetch_add(header.transactions_created.get(), Relaxed);
    counters.observe_epoch_transactions(header.transactions_created.get());

    let cached = {
        let mut reclaimed = thread.pool.reclaimed.borrow_mut();
        if reclaimed.len() < RECLAIMED_EPOCHS_LIMIT.load(Relaxed) {
            reclaimed.push(epoch);
            true
        } else {
            false
        }
    };
    if !cached {
        bitmap::clear(epoch.as_ptr() as usize, EPOCH_SIZE);
        token::account(*EPOCH_TOKEN, -(EPOCH_SIZE as i64), -1);
        unsafe { libc::free(epoch.as_ptr() as *mut libc::c_void) };
    }
}

/// Destroys arenas from the oldest end while their refcount is zero.
///
/// Destruction is deferred to the next open rather than performed at
/// close: transactions may be closed from other threads, and responses
/// are sometimes sent after the close but before the worker re-enters its
/// loop.
fn cleanup_transactions(thread: &Thread) {
    loop {
        let oldest = match thread.pool.open.borrow().front() {
            Some(&front) => front,
            None => break,
        };
        if unsafe { oldest.as_ref() }.ref_count.load(Acquire) != 0 {
            break;
        }
        let popped = thread.pool.open.borrow_mut().pop_front();
        debug_assert_eq!(popped, Some(oldest));
        epoch_destroy(thread, oldest);
    }
}

#[inline]
fn current_epoch(thread: &Thread) -> Option<NonNull<Epoch>> {
    thread.pool.open.borrow().back().copied()
}

/// Retires fully closed arenas for `thread`. Exposed to reclamation so a
/// synchronize also settles the pool.
pub(crate) fn reclaim_transactions(thread: &Thread) {
    cleanup_transactions(thread);
}

/// Transactions and pool scopes.

/// Opens a transaction on the calling thread and returns the handle that
/// must be passed to [`transaction_close`].
pub fn transaction_open() -> EpochRef {
    let thread = thread::current();
    cleanup_transactions(&thread);

    let epoch = match current_epoch(&thread) {
        Some(tail) => tail,
        None => epoch_create(&thread),
    };
    let header = unsafe { epoch.as_ref() };
    header.ref_count.fetch_add(1, Relaxed);
    header
        .transactions_created
        .set(header.transactions_created.get() + 1);
    EpochRef(epoch)
}

/// Closes a transaction. May be called from any thread; the owning thread
/// reclaims the arena on its next allocation path.
pub fn transaction_close(epoch: EpochRef) {
    let prev = epoch.header().ref_count.fetch_sub(1, Release);
    debug_assert!(prev > 0, "transaction closed twice");
}

/// Composite scope: enables pool allocation, opens a transaction, then
/// applies the requested local policy.
pub fn pool_open(enable: bool) -> PoolScope {
    let thread = thread::current();
    let saved = thread.malloc_state.get();
    thread.malloc_state.set(MallocState {
        pool_enabled: true,
        pool_allowed: true,
    });
    let epoch = transaction_open();
    let _ = set_pool_usage(enable);
    PoolScope { state: saved, epoch }
}

/// Closes the scope's transaction and restores the saved policy.
pub fn pool_close(scope: PoolScope) {
    transaction_close(scope.epoch);
    thread::current().malloc_state.set(scope.state);
}

/// Sets whether the current call stack may pool allocate, returning the
/// previous value. Forced off while the thread has pool allocation
/// disabled entirely.
pub fn set_pool_usage(enable: bool) -> bool {
    let thread = thread::current();
    let mut state = thread.malloc_state.get();
    let previous = state.pool_allowed;
    state.pool_allowed = enable && state.pool_enabled;
    thread.malloc_state.set(state);
    previous
}

#[inline]
pub fn gather_state() -> MallocState {
    thread::try_current().map_or_else(Default::default, |t| t.malloc_state.get())
}

#[inline]
pub fn restore_state(state: MallocState) {
    if let Some(thread) = thread::try_current() {
        thread.malloc_state.set(state);
    }
}

/// Attaches `cb(arg)` to run when `epoch`'s arena is destroyed. Useful
/// for resources that cannot live in the pool themselves.
///
/// # Safety
///
/// `cb(arg)` must remain sound to call until the arena dies.
pub unsafe fn adopt(cb: CleanupFn, arg: *mut u8, epoch: EpochRef) {
    let thread = thread::current();
    // The record is bump allocated from the newest arena, which is never
    // older than the adopting arena, so it outlives the cleanup run.
    let record = epoch_alloc(&thread, mem::size_of::<EpochCleanup>(), false).cast::<EpochCleanup>();
    record.as_ptr().write(EpochCleanup {
        cb,
        arg,
        next: epoch.header().cleanups.get(),
    });
    epoch.header().cleanups.set(Some(record));
}

/// Bump allocation.

fn epoch_bump(header: &Epoch, round_size: usize, clear: bool) -> Option<NonNull<u8>> {
    let offset = header.offset.get();
    let new_offset = offset + round_size;
    if unlikely!(new_offset > EPOCH_SIZE) {
        return None;
    }

    let base = header as *const Epoch as *mut u8;
    header.offset.set(new_offset);
    header.allocations.set(header.allocations.get() + 1);
    header
        .allocated_bytes
        .set(header.allocated_bytes.get() + round_size as u64);

    // The bump crossed a zeroing chunk boundary iff the offsets differ in
    // a bit of weight >= ZERO_GRANULARITY, which the xor exposes.
    if unlikely!((offset ^ new_offset) >= ZERO_GRANULARITY) {
        unsafe { bump_zero_slow(base, offset, new_offset, clear) };
    }

    Some(unsafe { NonNull::new_unchecked(base.add(offset)) })
}

/// On-demand zeroing shared by the zeroing and non-zeroing bump variants:
/// the zeroing variant pre-zeros from the chunk it left, the plain variant
/// zeros the chunk it entered to keep the invariant for later zeroing
/// bumps.
unsafe fn bump_zero_slow(base: *mut u8, offset: usize, new_offset: usize, clear: bool) {
    let old_chunk_end = (offset & !(ZERO_GRANULARITY - 1)) + ZERO_GRANULARITY;
    let chunk_begin = new_offset & !(ZERO_GRANULARITY - 1);
    let chunk_end = (chunk_begin + ZERO_GRANULARITY).min(EPOCH_SIZE);
    let clear_begin = if clear { old_chunk_end } else { chunk_begin };
    ptr::write_bytes(base.add(clear_begin), 0, chunk_end - clear_begin);
}

fn epoch_alloc(thread: &Thread, size: usize, clear: bool) -> NonNull<u8> {
    let epoch = current_epoch(thread).expect("pool allocation outside any transaction");

    if unlikely!(size >= LARGE_ALLOC_THRESHOLD) {
        return large_alloc(thread, EpochRef(epoch), size, clear);
    }

    let round_size = round_up(size.max(1), GUARANTEED_ALIGNMENT);
    let header = unsafe { &*epoch.as_ptr() };
    match epoch_bump(header, round_size, clear) {
        Some(ptr) => ptr,
        None => epoch_alloc_slow(thread, round_size, clear),
    }
}

/// The current arena is full. The fresh arena starts with refcount zero;
/// the open transaction keeps its count on an older arena, and oldest
/// first destruction retires this one with it.
#[inline(never)]
#[cold]
fn epoch_alloc_slow(thread: &Thread, round_size: usize, clear: bool) -> NonNull<u8> {
    let fresh = epoch_create(thread);
    epoch_bump(unsafe { &*fresh.as_ptr() }, round_size, clear)
        .expect("fresh arena rejected a small allocation")
}

unsafe fn large_free(ptr: *mut u8) {
    bitmap::clear(ptr as usize, 1);
    token::account(*LARGE_TOKEN, -(allocation_size(0, ptr) as i64), -1);
    libc::free(ptr as *mut libc::c_void);
}

#[inline(never)]
#[cold]
fn large_alloc(thread: &Thread, epoch: EpochRef, size: usize, clear: bool) -> NonNull<u8> {
    let mut raw: *mut libc::c_void = ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut raw, EPOCH_ALIGNMENT, round_up(size, GUARANTEED_ALIGNMENT)) };
    assert!(rc == 0 && !raw.is_null(), "posix_memalign failed for a large allocation");
    let raw = raw as *mut u8;

    if clear {
        unsafe { ptr::write_bytes(raw, 0, size) };
    }

    token::account(*LARGE_TOKEN, allocation_size(size, raw) as i64, 1);
    // Only the base granule needs protecting; free consults the bitmap
    // with the pointer it was handed.
    bitmap::set(raw as usize, 1);
    unsafe { adopt(large_free, raw, epoch) };

    debug_assert!(thread.pool.open.borrow().iter().any(|e| EpochRef(*e) == epoch));
    unsafe { NonNull::new_unchecked(raw) }
}

/// malloc(3) style interface.

#[inline]
fn should_use_pool(thread: &Thread, token: Token, flags: AllocFlags) -> bool {
    let state = thread.malloc_state.get();
    !flags.non_pool && token.pool_eligible() && state.pool_enabled && state.pool_allowed
}

pub fn malloc(token: Token, size: usize) -> NonNull<u8> {
    malloc_flags(token, size, AllocFlags::default())
}

pub fn malloc_flags(token: Token, size: usize, flags: AllocFlags) -> NonNull<u8> {
    let thread = thread::current();
    if should_use_pool(&thread, token, flags) {
        return epoch_alloc(&thread, size, false);
    }

    let size = size.max(1);
    let raw = unsafe { libc::malloc(size) } as *mut u8;
    assert!(!raw.is_null(), "malloc failure");
    let accounted = if token.fixed_size().is_some() {
        size
    } else {
        allocation_size(size, raw)
    };
    token::account(token, accounted as i64, 1);
    stats::pool().system_allocations.fetch_add(1, Relaxed);
    unsafe { NonNull::new_unchecked(raw) }
}

pub fn calloc(token: Token, nmemb: usize, size: usize) -> NonNull<u8> {
    calloc_flags(token, nmemb, size, AllocFlags::default())
}

pub fn calloc_flags(token: Token, nmemb: usize, size: usize, flags: AllocFlags) -> NonNull<u8> {
    let total = nmemb.checked_mul(size).expect("calloc overflow");
    let thread = thread::current();
    if should_use_pool(&thread, token, flags) {
        return epoch_alloc(&thread, total, true);
    }

    let total = total.max(1);
    let raw = unsafe { libc::calloc(1, total) } as *mut u8;
    assert!(!raw.is_null(), "calloc failure");
    let accounted = if token.fixed_size().is_some() {
        total
    } else {
        allocation_size(total, raw)
    };
    token::account(token, accounted as i64, 1);
    stats::pool().system_allocations.fetch_add(1, Relaxed);
    unsafe { NonNull::new_unchecked(raw) }
}

/// Zeroed allocation of one object of a fixed size type.
pub fn calloc_object(token: Token) -> NonNull<u8> {
    let size = token
        .fixed_size()
        .expect("calloc_object requires a fixed size type") as usize;
    calloc(token, 1, size)
}

/// Resizes a region.
///
/// Pool regions either fit in place or move to a fresh bump allocation;
/// there is no per-object free inside an arena, so growth simply abandons
/// the old bytes.
///
/// # Safety
///
/// `old` must be null or a live allocation of `token` whose current size
/// is `from`.
pub unsafe fn realloc(token: Token, old: *mut u8, from: usize, to: usize) -> NonNull<u8> {
    realloc_flags(token, old, from, to, AllocFlags::default())
}

pub unsafe fn realloc_flags(
    token: Token,
    old: *mut u8,
    from: usize,
    to: usize,
    flags: AllocFlags,
) -> NonNull<u8> {
    assert!(
        token.fixed_size().is_none(),
        "realloc requires a variable size type"
    );
    if old.is_null() {
        return malloc_flags(token, to, flags);
    }

    if bitmap::test(old as usize) {
        if from >= to {
            return NonNull::new_unchecked(old);
        }
        let new = epoch_alloc(&thread::current(), to, false);
        ptr::copy_nonoverlapping(old, new.as_ptr(), from.min(to));
        return new;
    }

    let to = to.max(1);
    let old_size = allocation_size(from, old) as i64;
    let raw = libc::realloc(old as *mut libc::c_void, to) as *mut u8;
    assert!(!raw.is_null(), "realloc failure");
    token::account(token, allocation_size(to, raw) as i64 - old_size, 0);
    NonNull::new_unchecked(raw)
}

/// Frees a region. Pool pointers are a no-op here because their arena is
/// freed wholesale.
///
/// # Safety
///
/// `ptr` must be null, a pool pointer, or a live system allocation of
/// `token`.
pub unsafe fn free(token: Token, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    if bitmap::test(ptr as usize) {
        return;
    }

    let size = match token.fixed_size() {
        Some(fixed) => fixed as usize,
        None => allocation_size(0, ptr),
    };
    token::account(token, -(size as i64), -1);
    libc::free(ptr as *mut libc::c_void);
}

/// Duplicates `size` bytes into a fresh allocation of `token`.
///
/// # Safety
///
/// `src` must be readable for `size` bytes.
pub unsafe fn copy(token: Token, src: *const u8, size: usize) -> NonNull<u8> {
    let dst = malloc(token, size);
    ptr::copy_nonoverlapping(src, dst.as_ptr(), size);
    dst
}

/// True iff `ptr` points into pool owned memory.
#[inline]
pub fn is_pool_pointer(ptr: *const u8) -> bool {
    bitmap::test(ptr as usize)
}

/// Open arena count for the calling thread.
pub fn open_epochs() -> usize {
    thread::current().pool.open.borrow().len()
}

/// Cached arena count for the calling thread.
pub fn reclaimed_epochs() -> usize {
    thread::current().pool.reclaimed.borrow().len()
}

/// Releases everything the thread still owns before its slot is reused.
pub(crate) fn release_on_deregister(thread: &Thread) {
    cleanup_transactions(thread);
    assert!(
        thread.pool.open.borrow().is_empty(),
        "deregistering with open pool transactions"
    );

    let cached: Vec<_> = thread.pool.reclaimed.borrow_mut().drain(..).collect();
    for epoch in cached {
        bitmap::clear(epoch.as_ptr() as usize, EPOCH_SIZE);
        token::account(*EPOCH_TOKEN, -(EPOCH_SIZE as i64), -1);
        unsafe { libc::free(epoch.as_ptr() as *mut libc::c_void) };
    }
}
