//! Single-writer object level software transactional memory.
//!
//! Reads are atomic with respect to write transactions: within a read
//! transaction the heap always looks consistent. There is only one writer
//! at a time, so the writer trivially sees a consistent heap too.
//!
//! Interception happens at the logical object level rather than the word
//! level: the runtime keeps multiple versions of objects, not of raw
//! memory. Every managed object pairs its canonical value with one linkage
//! word. Allocations are at least 4 byte aligned, so the two low bits of
//! the linkage word are free for metadata:
//!
//! | state                                   | low bits | high bits |
//! |-----------------------------------------|----------|-----------|
//! | no shadow                               | 00       | zero      |
//! | writer installed shadow, readers ignore | 10       | shadow    |
//! | published, commit phase in progress     | 11       | shadow    |
//!
//! The read fast path is two loads, a mask, a test, and a select. A
//! thread-local mask makes the same sequence correct for idle threads
//! (mask 0 selects canonical), readers (mask 01 selects the shadow only
//! once the commit phase publishes it), and the writer (mask 10 selects
//! its own installed shadows).
//!
//! Commit publishes every shadow with a single byte flip observed by a
//! process-wide barrier, copies the shadows back to canonical storage,
//! flips the byte off, waits on the barrier again, and hands the shadow
//! buffers to deferred reclamation.

use crate::{
    internal::{fvec::FVec, hook, md},
    pool::{self, AllocFlags},
    smr,
    thread::{self, CleanupFn, Thread, THREAD_LIMIT},
    token::{self, Mode, Token, TypeDecl},
};
use std::{
    cell::{Cell, RefCell, UnsafeCell},
    fmt, mem,
    ptr::{self, NonNull},
    sync::atomic::{
        fence, AtomicU32, AtomicU64, AtomicU8, AtomicUsize,
        Ordering::{Acquire, Relaxed, Release, SeqCst},
    },
};

/// Set in a reader's mask; a published linkage word has it set too.
pub const READER_BIT: usize = 1;
/// Set in the writer's mask and in every installed linkage word.
pub const WRITER_BIT: usize = 2;

const TAG_MASK: usize = READER_BIT | WRITER_BIT;

const fn round16(n: usize) -> usize {
    (n + 15) & !15
}

/// The linkage word of a managed object.
pub struct Linkage(AtomicUsize);

impl Linkage {
    #[inline]
    pub const fn new() -> Self {
        Linkage(AtomicUsize::new(0))
    }
}

impl fmt::Debug for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.0.load(Relaxed);
        f.debug_struct("Linkage")
            .field("shadow", &((bits & !TAG_MASK) as *const u8))
            .field("tag", &(bits & TAG_MASK))
            .finish()
    }
}

/// A canonical value plus its linkage word.
///
/// The layout matters: readers locate the two fields at fixed offsets and
/// the linkage word must be at least 4 byte aligned, which `usize` always
/// is.
#[repr(C)]
#[derive(Debug)]
pub struct StmCell<T> {
    data: UnsafeCell<T>,
    link: Linkage,
}

unsafe impl<T: Send> Send for StmCell<T> {}
unsafe impl<T: Send + Sync> Sync for StmCell<T> {}

/// Writer side vtable for one managed type. Every entry defaults to
/// memcpy or no-op when absent.
pub struct Ops {
    /// Bytes reserved for the shadow copy.
    pub shadow_size: usize,
    /// Bytes reserved for storage release metadata.
    pub release_size: usize,
    /// Initialise the shadow from the canonical value.
    pub init_shadow: Option<unsafe fn(*mut u8, *const u8)>,
    /// Prepare the shadow for writes.
    pub thaw_shadow: Option<unsafe fn(*mut u8)>,
    /// Turn the shadow into the read-only format readers expect.
    pub freeze_shadow: Option<unsafe fn(*mut u8)>,
    /// Stash information about the old canonical value in the release
    /// buffer.
    pub pre_release: Option<unsafe fn(*mut u8, *const u8)>,
    /// Write the shadow back to the canonical value.
    pub commit_shadow: Option<unsafe fn(*mut u8, *const u8)>,
    /// Release resources owned only by the previous value.
    pub release: Option<unsafe fn(*mut u8)>,
    /// Allocation type of shadow buffers for this object type.
    pub token: Token,
}

impl Ops {
    /// Defaults for a plain `T`: full size shadow and release buffers,
    /// memcpy everywhere.
    pub fn for_type<T>(token: Token) -> Ops {
        Ops {
            shadow_size: mem::size_of::<T>(),
            release_size: mem::size_of::<T>(),
            init_shadow: None,
            thaw_shadow: None,
            freeze_shadow: None,
            pre_release: None,
            commit_shadow: None,
            release: None,
            token,
        }
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ops")
            .field("shadow_size", &self.shadow_size)
            .field("release_size", &self.release_size)
            .field("token", &self.token)
            .finish()
    }
}

/// Writer private commit record: where to commit, and the shadow plus
/// release buffer backing it.
struct Record {
    ops: &'static Ops,
    release_offset: usize,
    object: *mut u8,
    link: *const Linkage,
    buf: NonNull<u8>,
}

struct TrivialCommit {
    link: *const Linkage,
    object: *mut u8,
    freeze: Option<unsafe fn(*mut u8)>,
}

const CLEANUP_INLINE_SIZE: usize = 16;

/// Inline cleanup-argument storage, aligned so callbacks may reinterpret
/// the bytes as any type up to word size (e.g. `*const usize`).
#[repr(align(8))]
#[derive(Clone, Copy)]
struct AlignedInlineBuf([u8; CLEANUP_INLINE_SIZE]);

impl AlignedInlineBuf {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

enum CleanupData {
    /// Size 0: pass the pointer through untouched.
    Ptr(*mut u8),
    /// Small arguments are copied inline so the original storage may be
    /// freed before the cleanup runs.
    Inline(AlignedInlineBuf),
    /// Larger arguments are copied to a heap buffer freed after the call.
    Heap(NonNull<u8>),
}

struct CleanupCall {
    cb: CleanupFn,
    data: CleanupData,
}

struct StmTls {
    /// 0 outside transactions, `READER_BIT` in read transactions,
    /// `WRITER_BIT` in the write transaction.
    mask: Cell<usize>,
    /// 0 normally, all ones while a write transaction is open here.
    writing: Cell<usize>,
    depth: Cell<u32>,
    trivial: Cell<bool>,
    commit_list: RefCell<FVec<Record>>,
    trivial_commits: RefCell<FVec<TrivialCommit>>,
    cleanups: RefCell<FVec<CleanupCall>>,
    /// The reclamation section backing the open read transaction. Boxed
    /// for a stable address across open and close.
    read_section: RefCell<Box<smr::Section>>,
}

thread_local! {
    static TLS: StmTls = StmTls {
        mask: Cell::new(0),
        writing: Cell::new(0),
        depth: Cell::new(0),
        trivial: Cell::new(false),
        commit_list: RefCell::new(FVec::new()),
        trivial_commits: RefCell::new(FVec::new()),
        cleanups: RefCell::new(FVec::new()),
        read_section: RefCell::new(Box::new(smr::Section::new())),
    };
}

lazy_static::lazy_static! {
    static ref CLEANUP_BUF_TOKEN: Token = token::register(&TypeDecl {
        name: "stm:cleanup_buf",
        mode: Mode::Variable,
        pool_eligible: false,
    });
}

impl<T> StmCell<T> {
    pub const fn new(value: T) -> Self {
        StmCell {
            data: UnsafeCell::new(value),
            link: Linkage::new(),
        }
    }

    /// Raw pointer to the canonical value.
    #[inline]
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    #[inline]
    pub fn link(&self) -> &Linkage {
        &self.link
    }

    pub fn into_inner(self) -> T {
        debug_assert_eq!(self.link.0.load(Relaxed), 0, "consuming a cell mid commit");
        self.data.into_inner()
    }

    /// Opens the object for reads, returning the buffer to read from:
    /// the canonical value normally, or the published shadow during a
    /// commit phase observed from inside a read transaction. The identity
    /// function outside transactions.
    ///
    /// The returned pointer stays valid until the surrounding transaction
    /// closes or cycles.
    #[inline]
    pub fn read(&self) -> *const T {
        let data = self.data.get() as *const T;
        if !hook::STM_READ.enabled() {
            return data;
        }

        let bits = self.link.0.load(Acquire);
        let shadow = (bits & !TAG_MASK) as *const T;
        if bits & TLS.with(|t| t.mask.get()) == 0 {
            data
        } else {
            shadow
        }
    }

    /// Opens the object for writes, returning the private shadow to
    /// mutate. Behaves like [`read`](StmCell::read) outside a write
    /// transaction.
    ///
    /// # Safety
    ///
    /// The cell must stay live and pinned in place until the write
    /// transaction commits and its release callback has run.
    #[inline]
    pub unsafe fn write(&self, ops: &'static Ops) -> *mut T {
        TLS.with(|tls| {
            if tls.writing.get() == 0 {
                return self.read() as *mut T;
            }

            let bits = self.link.0.load(Relaxed);
            if bits != 0 {
                // Already opened by this transaction; reuse the shadow.
                return (bits & !TAG_MASK) as *mut T;
            }

            write_slow(tls, self.data.get() as *mut u8, &self.link, ops) as *mut T
        })
    }

    /// Republishes the private buffer of a non-trivially opened object
    /// back to the globally visible one. Needed when zero-filled objects
    /// are not a valid state.
    ///
    /// # Safety
    ///
    /// Same contract as [`write`](StmCell::write).
    pub unsafe fn write_back(&self, ops: &'static Ops) {
        write_back_raw(
            self.data.get() as *mut u8,
            mem::size_of::<T>(),
            &self.link,
            ops,
        )
    }
}

#[inline(never)]
#[cold]
fn write_slow(tls: &StmTls, object: *mut u8, link: &Linkage, ops: &'static Ops) -> *mut u8 {
    debug_assert_eq!(link.0.load(Relaxed), 0);

    if tls.trivial.get() {
        tls.trivial_commits.borrow_mut().push(TrivialCommit {
            link,
            object,
            freeze: ops.freeze_shadow,
        });
        link.0.store(object as usize | WRITER_BIT, Release);
        return object;
    }

    let release_offset = round16(ops.shadow_size);
    let total = release_offset + ops.release_size;
    let buf = pool::calloc_flags(ops.token, 1, total, AllocFlags { non_pool: true });
    let bits = buf.as_ptr() as usize;
    assert_eq!(bits & TAG_MASK, 0, "shadow buffer under aligned");

    unsafe {
        match ops.init_shadow {
            Some(init) => init(buf.as_ptr(), object),
            None => ptr::copy_nonoverlapping(object, buf.as_ptr(), ops.shadow_size),
        }
        if let Some(thaw) = ops.thaw_shadow {
            thaw(buf.as_ptr());
        }
    }

    tls.commit_list.borrow_mut().push(Record {
        ops,
        release_offset,
        object,
        link,
        buf,
    });
    link.0.store(bits | WRITER_BIT, Release);
    buf.as_ptr()
}

/// Free function form of [`StmCell::write_back`] for objects managed
/// outside a cell.
///
/// # Safety
///
/// `dst` must be the canonical buffer `link` belongs to.
pub unsafe fn write_back_raw(dst: *mut u8, dst_size: usize, link: &Linkage, ops: &'static Ops) {
    let bits = link.0.load(Relaxed);
    if bits & READER_BIT != 0 {
        return;
    }

    let src = (bits & !WRITER_BIT) as *const u8;
    if src.is_null() || src == dst as *const u8 {
        return;
    }

    assert_eq!(dst_size, ops.shadow_size);
    ptr::copy_nonoverlapping(src, dst, dst_size);
    if let Some(thaw) = ops.thaw_shadow {
        thaw(dst);
    }
}

/// Commit barrier.
///
/// The writer needs to know when every worker has observed a write to the
/// commit flag. Opening, closing, and cycling read transactions all count
/// as passing the barrier, and the worker heartbeat observes it too, so
/// even an idle worker checks in within one heartbeat period.

struct BarrierRecord {
    active: AtomicU8,
    flag: AtomicU8,
}

static BARRIER: [BarrierRecord; THREAD_LIMIT] = {
    const R: BarrierRecord = BarrierRecord {
        active: AtomicU8::new(0),
        flag: AtomicU8::new(0),
    };
    [R; THREAD_LIMIT]
};

static COMMIT_IN_PROGRESS: AtomicU8 = AtomicU8::new(0);
static WRITER_COUNT: AtomicU32 = AtomicU32::new(0);
static COMMIT_BARRIER_TIMEOUT_US: AtomicU64 = AtomicU64::new(1_000_000);

static COMMIT_POISON: u8 = 0;

#[inline]
fn poison_tag() -> *mut u8 {
    &COMMIT_POISON as *const u8 as *mut u8
}

/// Sets the commit barrier timeout. Workers check in every heartbeat, so
/// the default of one second should never be reached.
pub fn set_commit_barrier_timeout_us(timeout_us: u64) {
    COMMIT_BARRIER_TIMEOUT_US.store(timeout_us, Relaxed);
}

/// True while a commit phase is in progress anywhere in the process.
pub fn commit_in_progress() -> bool {
    COMMIT_IN_PROGRESS.load(SeqCst) != 0
}

/// Enrolls the calling thread in the commit barrier.
pub fn register_thread() {
    let id = thread::current().id as usize;
    BARRIER[id].flag.store(0, SeqCst);
    BARRIER[id].active.store(1, SeqCst);
}

/// Withdraws the calling thread from the commit barrier.
pub fn deregister_thread() {
    let id = thread::current().id as usize;
    BARRIER[id].active.store(0, SeqCst);
    BARRIER[id].flag.store(0, SeqCst);
}

#[inline]
fn observe_flag(id: usize) {
    BARRIER[id].flag.store(0, SeqCst);
}

/// Heartbeat hook: cycles a read transaction left open at the top level
/// and marks the barrier observed.
pub(crate) fn observe(thread: &Thread) {
    let stuck = TLS.with(|tls| tls.depth.get() > 0 && tls.writing.get() == 0);
    if stuck {
        cycle_read();
    }
    observe_flag(thread.id as usize);
}

/// Returns true when some worker failed to check in before the deadline.
fn barrier(timeout_us: u64) -> bool {
    let self_id = thread::current_id();
    let deadline = md::ticks().saturating_add(md::us_to_ticks(timeout_us));
    let mut timed_out = false;

    fence(SeqCst);
    for id in 0..THREAD_LIMIT {
        if BARRIER[id].active.load(SeqCst) != 0 {
            let _ = BARRIER[id].flag.swap(1, SeqCst);
        }
    }

    for id in 0..THREAD_LIMIT {
        if Some(id as u32) != self_id {
            'wait: loop {
                for _ in 0..128 {
                    if !smr::record_is_active(id)
                        || BARRIER[id].active.load(SeqCst) == 0
                        || BARRIER[id].flag.load(SeqCst) == 0
                    {
                        break 'wait;
                    }
                    std::hint::spin_loop();
                }
                if timeout_us != 0 && md::ticks() >= deadline {
                    timed_out = true;
                    break 'wait;
                }
            }
        }
        BARRIER[id].flag.store(0, SeqCst);
    }

    timed_out
}

/// Read and write transaction surface.

/// Resets the read transaction bookkeeping when a recoverable fault
/// unwinds across it; the reclamation section below this record on the
/// cleanup stack closes itself right after.
unsafe fn read_unwind_reset(_: *mut u8) {
    TLS.with(|tls| {
        tls.depth.set(0);
        tls.mask.set(0);
    });
    if let Some(id) = thread::current_id() {
        observe_flag(id as usize);
    }
}

/// Opens a read transaction: arms reclamation and directs reads at
/// published shadows for the duration. Nests.
pub fn open_read() {
    TLS.with(|tls| {
        let depth = tls.depth.get();
        tls.depth.set(depth + 1);
        if depth > 0 {
            return;
        }

        assert_eq!(tls.mask.get(), 0, "read transaction over an active transaction");
        tls.mask.set(READER_BIT);
        smr::begin(&mut tls.read_section.borrow_mut());
        thread::push_cleanup(read_unwind_reset, ptr::null_mut());
        observe_flag(thread::current().id as usize);
    })
}

/// Closes a read transaction. Must pair with [`open_read`], or the
/// read-side critical section never ends.
pub fn close_read() {
    TLS.with(|tls| {
        let depth = tls.depth.get();
        assert!(depth > 0, "close_read without an open read transaction");
        tls.depth.set(depth - 1);
        if depth > 1 {
            return;
        }

        assert_eq!(tls.mask.get(), READER_BIT);
        tls.mask.set(0);
        thread::pop_cleanup(read_unwind_reset, ptr::null_mut());
        smr::end(&mut tls.read_section.borrow_mut());
        observe_flag(thread::current().id as usize);
    })
}

/// Closes the current read transaction if one is open, then reopens it.
pub fn cycle_read() {
    let depth = TLS.with(|tls| tls.depth.get());
    assert!(depth <= 1, "cycling a nested read transaction");
    if depth > 0 {
        close_read();
    }
    open_read();
}

/// Opens the process's single write transaction on this thread. Closed by
/// [`commit`]; rollback does not exist.
///
/// A trivial transaction skips shadow copies: [`StmCell::write`] hands
/// back the canonical buffer for in-place edits that racing readers may
/// observe, such as flag toggles, and `freeze_shadow` runs on it at
/// commit.
pub fn open_write(trivial: bool) {
    TLS.with(|tls| {
        assert_eq!(tls.depth.get(), 0, "write transaction over an open transaction");
        tls.depth.set(1);
        assert!(tls.commit_list.borrow().is_empty());
        assert!(tls.trivial_commits.borrow().is_empty());
        assert_eq!(COMMIT_IN_PROGRESS.load(SeqCst), 0);
        assert_eq!(
            WRITER_COUNT.fetch_add(1, SeqCst),
            0,
            "a second write transaction was opened"
        );

        assert_eq!(tls.writing.get(), 0);
        tls.writing.set(!0);
        tls.trivial.set(trivial);
        tls.mask.set(WRITER_BIT);

        hook::STM_READ.activate();
        thread::push_poison(poison_tag());
    })
}

/// Schedules `cb(arg)` for just after the transaction.
///
/// Inside a write transaction the call is deferred to the release phase;
/// outside it runs immediately. With `size > 0` the argument bytes are
/// copied (inline up to 16 bytes) so the original storage may be freed
/// before the cleanup runs; with `size == 0` the pointer is passed
/// through.
///
/// # Safety
///
/// `cb` must remain sound to call at release time with the recorded
/// argument.
pub unsafe fn call(cb: CleanupFn, arg: *mut u8, size: usize) {
    let deferred = TLS.with(|tls| tls.writing.get() != 0);
    if !deferred {
        cb(arg);
        return;
    }

    let data = if size == 0 {
        CleanupData::Ptr(arg)
    } else if size <= CLEANUP_INLINE_SIZE {
        let mut buf = AlignedInlineBuf([0u8; CLEANUP_INLINE_SIZE]);
        ptr::copy_nonoverlapping(arg as *const u8, buf.as_mut_ptr(), size);
        CleanupData::Inline(buf)
    } else {
        let heap = pool::malloc_flags(*CLEANUP_BUF_TOKEN, size, AllocFlags { non_pool: true });
        ptr::copy_nonoverlapping(arg as *const u8, heap.as_ptr(), size);
        CleanupData::Heap(heap)
    };

    TLS.with(|tls| tls.cleanups.borrow_mut().push(CleanupCall { cb, data }));
}

/// Routes to [`call`] inside a write transaction and to [`smr::call`]
/// otherwise.
///
/// # Safety
///
/// Union of the two callees' contracts.
pub unsafe fn smr_call(ptr: *mut u8, cb: CleanupFn) {
    if TLS.with(|tls| tls.writing.get()) != 0 {
        call(cb, ptr, 0)
    } else {
        smr::call(ptr, cb)
    }
}

/// Commit machinery.

fn freeze_and_publish(records: &FVec<Record>) {
    for record in records.iter() {
        unsafe {
            if let Some(freeze) = record.ops.freeze_shadow {
                freeze(record.buf.as_ptr());
            }

            let release = record.buf.as_ptr().add(record.release_offset);
            match record.ops.pre_release {
                Some(pre) => pre(release, record.object),
                None => {
                    if record.ops.release_size > 0 {
                        ptr::copy_nonoverlapping(record.object, release, record.ops.release_size)
                    }
                }
            }

            let bits = record.buf.as_ptr() as usize;
            debug_assert_eq!(bits & TAG_MASK, 0);
            (*record.link).0.store(bits | WRITER_BIT | READER_BIT, Release);
        }
    }
}

fn apply_commits(records: &FVec<Record>, trivials: FVec<TrivialCommit>) {
    for record in records.iter() {
        unsafe {
            match record.ops.commit_shadow {
                Some(commit) => commit(record.object, record.buf.as_ptr()),
                None => {
                    ptr::copy_nonoverlapping(record.buf.as_ptr(), record.object, record.ops.shadow_size)
                }
            }
            // Readers redirected to the shadow must not see the link
            // clear before canonical holds the committed bytes.
            fence(Release);
            (*record.link).0.store(0, Release);
        }
    }

    for trivial in trivials {
        unsafe {
            if let Some(freeze) = trivial.freeze {
                freeze(trivial.object);
            }
            (*trivial.link).0.store(0, Release);
        }
    }
}

struct ReleaseBatch {
    records: FVec<Record>,
    cleanups: FVec<CleanupCall>,
}

unsafe fn run_cleanups(cleanups: FVec<CleanupCall>) {
    // LIFO, matching the order scopes were entered.
    for cleanup in cleanups.into_iter().rev() {
        match cleanup.data {
            CleanupData::Ptr(ptr) => (cleanup.cb)(ptr),
            CleanupData::Inline(mut buf) => (cleanup.cb)(buf.as_mut_ptr()),
            CleanupData::Heap(heap) => {
                (cleanup.cb)(heap.as_ptr());
                pool::free(*CLEANUP_BUF_TOKEN, heap.as_ptr());
            }
        }
    }
}

unsafe fn release_batch(ptr: *mut u8) {
    let batch = Box::from_raw(ptr as *mut ReleaseBatch);

    // Shallow bind the transactional view to "outside any transaction"
    // while destructors run.
    let (mask, writing) = TLS.with(|tls| {
        let saved = (tls.mask.get(), tls.writing.get());
        tls.mask.set(0);
        tls.writing.set(0);
        saved
    });

    for record in batch.records.into_iter() {
        if let Some(release) = record.ops.release {
            release(record.buf.as_ptr().add(record.release_offset));
        }
        pool::free(record.ops.token, record.buf.as_ptr());
    }
    run_cleanups(batch.cleanups);

    TLS.with(|tls| {
        tls.mask.set(mask);
        tls.writing.set(writing);
    });
}

fn schedule_release(records: FVec<Record>, cleanups: FVec<CleanupCall>) {
    if records.is_empty() && cleanups.is_empty() {
        return;
    }
    let batch = Box::into_raw(Box::new(ReleaseBatch { records, cleanups }));
    unsafe { smr::call(batch as *mut u8, release_batch) };
}

/// Atomically commits outstanding writes and ends the write transaction.
/// Returns true if there was anything to commit.
pub fn commit() -> bool {
    thread::pop_poison(poison_tag());
    let thread = thread::current();

    TLS.with(|tls| {
        assert_eq!(tls.depth.get(), 1, "commit without an open write transaction");
        tls.depth.set(0);
        assert_eq!(tls.writing.get(), !0usize);

        let records = mem::take(&mut *tls.commit_list.borrow_mut());
        let trivials = mem::take(&mut *tls.trivial_commits.borrow_mut());
        let committed = !records.is_empty() || !trivials.is_empty();

        if committed {
            let timeout_us = COMMIT_BARRIER_TIMEOUT_US.load(Relaxed);

            // Phase 1: convert the writes to the publication format and
            // make them visible to commit phase readers.
            freeze_and_publish(&records);
            let prev = COMMIT_IN_PROGRESS.swap(1, SeqCst);
            assert_eq!(prev, 0, "overlapping commit phases");
            observe_flag(thread.id as usize);
            if barrier(timeout_us) {
                log::warn!("commit barrier timed out after {} us, publishing anyway", timeout_us);
            }

            // Phase 2: every reader now goes through the shadows, so the
            // canonical buffers are private to the writer.
            apply_commits(&records, trivials);
            let prev = COMMIT_IN_PROGRESS.swap(0, SeqCst);
            assert_eq!(prev, 1);
            observe_flag(thread.id as usize);
            if barrier(timeout_us) {
                log::warn!("commit barrier timed out after {} us, releasing anyway", timeout_us);
            }
        }

        tls.writing.set(0);
        tls.trivial.set(false);
        tls.mask.set(0);
        hook::STM_READ.deactivate();
        assert_eq!(
            WRITER_COUNT.fetch_sub(1, SeqCst),
            1,
            "writer count corrupted"
        );

        // Phase 3: shadow buffers and deferred cleanups go through
        // reclamation once no reader can hold a shadow pointer.
        let cleanups = mem::take(&mut *tls.cleanups.borrow_mut());
        schedule_release(records, cleanups);
        committed
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn on_worker(f: impl FnOnce() + Send) {
        let _serial = crate::test_util::serial();
        crossbeam_utils::thread::scope(|s| {
            s.spawn(|_| {
                let handle = thread::register(false).unwrap();
                register_thread();
                f();
                deregister_thread();
                thread::deregister(handle);
            })
            .join()
            .unwrap();
        })
        .unwrap()
    }

    lazy_static::lazy_static! {
        static ref CELL_TOKEN: Token = token::register(&TypeDecl {
            name: "stm-test:cell",
            mode: Mode::Variable,
            pool_eligible: false,
        });
        static ref INT_OPS: Ops = Ops::for_type::<u64>(*CELL_TOKEN);
    }

    #[test]
    fn read_outside_transactions_is_canonical() {
        on_worker(|| {
            let cell = StmCell::new(7u64);
            assert_eq!(unsafe { *cell.read() }, 7);
        });
    }

    #[test]
    fn write_outside_transaction_reads() {
        on_worker(|| {
            let cell = StmCell::new(9u64);
            let p = unsafe { cell.write(&INT_OPS) };
            assert_eq!(p as *const u64, cell.data_ptr() as *const u64);
        });
    }

    #[test]
    fn commit_applies_shadow() {
        on_worker(|| {
            let cell = StmCell::new(42u64);

            open_write(false);
            let shadow = unsafe { cell.write(&INT_OPS) };
            assert_ne!(shadow as *const u64, cell.data_ptr() as *const u64);
            // The writer's own reads see the shadow.
            assert_eq!(cell.read(), shadow as *const u64);
            unsafe { *shadow = 99 };
            assert!(commit());

            assert_eq!(unsafe { *cell.read() }, 99);
            // Release the shadow buffer.
            assert!(smr::poll());
        });
    }

    #[test]
    fn empty_commit_returns_false() {
        on_worker(|| {
            open_write(false);
            assert!(!commit());
        });
    }

    #[test]
    fn write_reuses_shadow() {
        on_worker(|| {
            let cell = StmCell::new(1u64);
            open_write(false);
            let first = unsafe { cell.write(&INT_OPS) };
            let second = unsafe { cell.write(&INT_OPS) };
            assert_eq!(first, second);
            assert!(commit());
            assert!(smr::poll());
        });
    }

    #[test]
    fn trivial_write_toggles_linkage_only() {
        on_worker(|| {
            let cell = StmCell::new(5u64);
            open_write(true);
            let p = unsafe { cell.write(&INT_OPS) };
            // Trivial opens hand back the canonical buffer.
            assert_eq!(p as *const u64, cell.data_ptr() as *const u64);
            unsafe { *p = 6 };
            assert!(commit());
            assert_eq!(unsafe { *cell.read() }, 6);
            let _ = smr::poll();
        });
    }

    #[test]
    fn calls_defer_inside_write_transactions() {
        use std::sync::atomic::{AtomicUsize, Ordering::Relaxed as R};
        static RAN: AtomicUsize = AtomicUsize::new(0);
        static VALUE_SEEN: AtomicUsize = AtomicUsize::new(0);

        unsafe fn record(p: *mut u8) {
            RAN.fetch_add(1, R);
            VALUE_SEEN.store(*(p as *const usize), R);
        }

        on_worker(|| {
            RAN.store(0, R);

            // Outside a transaction the call is immediate.
            let mut v = 17usize;
            unsafe { call(record, &mut v as *mut usize as *mut u8, 0) };
            assert_eq!(RAN.load(R), 1);

            open_write(false);
            let mut copied = 23usize;
            unsafe {
                call(
                    record,
                    &mut copied as *mut usize as *mut u8,
                    mem::size_of::<usize>(),
                )
            };
            // The argument was copied; clobbering the original is fine.
            copied = 0;
            assert_eq!(copied, 0);
            assert_eq!(RAN.load(R), 1, "deferred call ran before release");
            assert!(!commit());
            assert!(smr::poll());
            assert_eq!(RAN.load(R), 2);
            assert_eq!(VALUE_SEEN.load(R), 23);
        });
    }

    #[test]
    fn release_hooks_see_old_value() {
        use std::sync::atomic::{AtomicU64, Ordering::Relaxed as R};
        static RELEASED: AtomicU64 = AtomicU64::new(0);

        unsafe fn release(buf: *mut u8) {
            RELEASED.store(*(buf as *const u64), R);
        }

        lazy_static::lazy_static! {
            static ref RELEASE_OPS: Ops = Ops {
                release: Some(release),
                ..Ops::for_type::<u64>(*CELL_TOKEN)
            };
        }

        on_worker(|| {
            RELEASED.store(0, R);
            let cell = StmCell::new(111u64);

            open_write(false);
            let shadow = unsafe { cell.write(&RELEASE_OPS) };
            unsafe { *shadow = 222 };
            assert!(commit());
            assert!(smr::poll());

            // The release buffer was filled from the pre-commit value.
            assert_eq!(RELEASED.load(R), 111);
            assert_eq!(unsafe { *cell.read() }, 222);
        });
    }

    #[test]
    fn cycle_read_is_idempotent() {
        on_worker(|| {
            cycle_read();
            cycle_read();
            close_read();

            open_read();
            open_read();
            close_read();
            close_read();
        });
    }
}
