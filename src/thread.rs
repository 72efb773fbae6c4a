//! Thread registry and per-thread scope stack.
//!
//! Worker threads register to obtain a small dense id below
//! [`THREAD_LIMIT`]. The id indexes every per-thread table in the crate:
//! the quiescence records consulted by reclamation, the commit barrier
//! records, and the rows of big-reader lock tables. Ids are reused after
//! deregistration.
//!
//! Each registered thread also carries a cleanup stack: a growable array of
//! `{callback, argument}` records pushed by scoped acquisitions (locks,
//! reclamation sections) and popped on the way out. A record without a
//! callback is a poison marker asserting that no recoverable unwind may
//! cross it. The stack is consumed by [`catch_soft_fault`], the structured
//! replacement for a signal handler that longjmps back to a safe point:
//! on a caught panic it runs cleanups down to the scope's watermark and
//! reports the fault, subject to the configured consecutive and lifetime
//! limits.

use crate::internal::{fvec::FVec, quiesce::ThreadEpoch};
use lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};
use std::{
    cell::{Cell, RefCell, UnsafeCell},
    fmt,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::atomic::{
        AtomicBool, AtomicU32,
        Ordering::{Relaxed, SeqCst},
    },
};

/// Compile time bound on concurrently registered threads.
pub const THREAD_LIMIT: usize = 32;

/// Depth past which the cleanup stack is assumed to be leaking a scope.
const CLEANUP_DEPTH_WARNING: usize = 128;

/// Callback type shared by the cleanup stack, arena cleanups, and deferred
/// reclamation.
pub type CleanupFn = unsafe fn(*mut u8);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Cleanup {
    /// `None` is the poison marker.
    cb: Option<CleanupFn>,
    arg: *mut u8,
}

/// The part of a thread's state that other threads read: its quiescence
/// epoch and whether the slot is live. Everything is statically allocated
/// so onlookers never chase a pointer into memory that a deregistering
/// thread could free.
pub(crate) struct SharedRecord {
    pub(crate) epoch: ThreadEpoch,
    registered: AtomicBool,
}

impl SharedRecord {
    const fn new() -> Self {
        SharedRecord {
            epoch: ThreadEpoch::inactive(),
            registered: AtomicBool::new(false),
        }
    }
}

static SHARED: [SharedRecord; THREAD_LIMIT] = {
    const R: SharedRecord = SharedRecord::new();
    [R; THREAD_LIMIT]
};

/// Slot occupancy, mutated under a raw spinlock; `SharedRecord::registered`
/// is the lock free mirror that barrier and reclamation scans read.
struct SlotTable {
    slots: UnsafeCell<[bool; THREAD_LIMIT]>,
    mutex: RawMutex,
}

// Synchronized by the raw mutex below.
unsafe impl Sync for SlotTable {}

impl SlotTable {
    fn with<R>(&self, f: impl FnOnce(&mut [bool; THREAD_LIMIT]) -> R) -> R {
        self.mutex.lock();
        let result = f(unsafe { &mut *self.slots.get() });
        unsafe { self.mutex.unlock() };
        result
    }
}

static REGISTRY: SlotTable = SlotTable {
    slots: UnsafeCell::new([false; THREAD_LIMIT]),
    mutex: RawMutex::INIT,
};

type Command = Box<dyn FnOnce() + Send + 'static>;

static COMMANDS: [Mutex<Vec<Command>>; THREAD_LIMIT] = {
    const Q: Mutex<Vec<Command>> = parking_lot::const_mutex(Vec::new());
    [Q; THREAD_LIMIT]
};

#[inline]
pub(crate) fn shared(id: usize) -> &'static SharedRecord {
    &SHARED[id]
}

#[inline]
pub(crate) fn is_registered(id: usize) -> bool {
    SHARED[id].registered.load(SeqCst)
}

/// Thread local state reachable from the registered thread only.
pub(crate) struct Thread {
    pub(crate) id: u32,
    is_preferred: bool,
    cleanups: RefCell<FVec<Cleanup>>,
    /// Cleanup stack depth at the start of the innermost recoverable
    /// scope. Entries below it are never run by fault recovery.
    irrevocable: Cell<usize>,
    unwind_armed: Cell<bool>,
    pub(crate) malloc_state: Cell<crate::pool::MallocState>,
    pub(crate) pool: crate::pool::PoolLocal,
    pub(crate) smr: crate::smr::SmrLocal,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Thread>>> = RefCell::new(None);
}

#[inline]
pub(crate) fn try_current() -> Option<Rc<Thread>> {
    CURRENT.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn current() -> Rc<Thread> {
    try_current().expect("current thread is not registered")
}

/// Dense id of the calling thread, if registered.
#[inline]
pub fn current_id() -> Option<u32> {
    try_current().map(|t| t.id)
}

/// True for threads registered with the preferred worker flag.
#[inline]
pub fn is_preferred_worker() -> bool {
    try_current().map_or(false, |t| t.is_preferred)
}

/// Proof of registration; surrender it to [`deregister`].
pub struct ThreadHandle {
    id: u32,
}

impl ThreadHandle {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle").field("id", &self.id).finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    /// All `THREAD_LIMIT` slots are taken.
    Exhausted,
    /// The calling thread is already registered.
    AlreadyRegistered,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::Exhausted => write!(f, "all thread slots are in use"),
            RegisterError::AlreadyRegistered => write!(f, "thread is already registered"),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Registers the calling thread, assigning the smallest free id.
pub fn register(is_preferred: bool) -> Result<ThreadHandle, RegisterError> {
    if try_current().is_some() {
        return Err(RegisterError::AlreadyRegistered);
    }

    let free = REGISTRY.with(|slots| {
        let free = slots.iter().position(|occupied| !*occupied);
        if let Some(id) = free {
            slots[id] = true;
        }
        free
    });
    let id = match free {
        Some(id) => id,
        None => return Err(RegisterError::Exhausted),
    };

    let record = shared(id);
    debug_assert!(!record.epoch.is_active(Relaxed), "reused slot left active");

    let thread = Rc::new(Thread {
        id: id as u32,
        is_preferred,
        cleanups: RefCell::new(FVec::new()),
        irrevocable: Cell::new(0),
        unwind_armed: Cell::new(false),
        malloc_state: Cell::new(Default::default()),
        pool: Default::default(),
        smr: Default::default(),
    });
    CURRENT.with(|c| *c.borrow_mut() = Some(thread));
    record.registered.store(true, SeqCst);

    Ok(ThreadHandle { id: id as u32 })
}

/// Deregisters the calling thread and releases its id for reuse.
///
/// The thread must be outside all reclamation sections and pool
/// transactions; deferred destruction still pending on this thread is
/// flushed synchronously first.
pub fn deregister(handle: ThreadHandle) {
    let thread = current();
    assert_eq!(thread.id, handle.id, "handle does not belong to this thread");
    assert!(
        !thread.unwind_armed.get(),
        "deregistering inside a recoverable scope"
    );

    crate::smr::flush_on_deregister(&thread);
    crate::pool::release_on_deregister(&thread);
    assert!(
        thread.cleanups.borrow().is_empty(),
        "deregistering with pending cleanups"
    );

    let id = thread.id as usize;
    drop(thread);
    shared(id).registered.store(false, SeqCst);
    CURRENT.with(|c| *c.borrow_mut() = None);
    COMMANDS[id].lock().clear();
    REGISTRY.with(|slots| slots[id] = false);
}

/// Number of currently registered threads.
pub fn count() -> usize {
    REGISTRY.with(|slots| slots.iter().filter(|occupied| **occupied).count())
}

/// Cleanup stack.

#[inline]
fn push(record: Cleanup) {
    let thread = current();
    let mut stack = thread.cleanups.borrow_mut();
    if unlikely!(stack.next_push_allocates()) {
        stack.grow();
    }
    stack.push(record);
    if unlikely!(stack.len() == CLEANUP_DEPTH_WARNING + 1) {
        log::warn!(
            "thread {} cleanup depth {}, likely missing an unlock or pop",
            thread.id,
            stack.len()
        );
    }
}

#[inline]
fn pop(expected: Cleanup) {
    let thread = current();
    let mut stack = thread.cleanups.borrow_mut();
    let top = stack.pop().expect("cleanup stack underflow");
    assert!(
        top == expected,
        "mismatched cleanup pop on thread {}",
        thread.id
    );
}

/// Pushes a cleanup to run if the enclosing recoverable scope unwinds.
#[inline]
pub fn push_cleanup(cb: CleanupFn, arg: *mut u8) {
    push(Cleanup { cb: Some(cb), arg });
}

/// Pops a cleanup pushed by [`push_cleanup`]; the pair must match.
#[inline]
pub fn pop_cleanup(cb: CleanupFn, arg: *mut u8) {
    pop(Cleanup { cb: Some(cb), arg });
}

/// Pushes a poison marker: recoverable unwinds must not cross it.
#[inline]
pub fn push_poison(tag: *mut u8) {
    push(Cleanup { cb: None, arg: tag });
}

#[inline]
pub fn pop_poison(tag: *mut u8) {
    pop(Cleanup { cb: None, arg: tag });
}

#[cfg(test)]
pub(crate) fn cleanup_depth() -> usize {
    current().cleanups.borrow().len()
}

/// Soft fault recovery.

static MAX_CONSECUTIVE: AtomicU32 = AtomicU32::new(0);
static MAX_TOTAL: AtomicU32 = AtomicU32::new(0);
static CONSECUTIVE: AtomicU32 = AtomicU32::new(0);
static TOTAL: AtomicU32 = AtomicU32::new(0);
static CONSECUTIVE_WATERMARK: AtomicU32 = AtomicU32::new(0);

/// Sets the recovery policy. A limit of zero disables recovery entirely;
/// both limits must be nonzero for faults to be caught.
pub fn set_soft_fault_limits(max_consecutive: u32, max_total: u32) {
    MAX_CONSECUTIVE.store(max_consecutive, SeqCst);
    MAX_TOTAL.store(max_total, SeqCst);
}

#[inline]
pub fn soft_faults_enabled() -> bool {
    MAX_CONSECUTIVE.load(SeqCst) > 0 && MAX_TOTAL.load(SeqCst) > 0
}

/// A fault caught and recovered by [`catch_soft_fault`].
#[derive(Debug)]
pub struct SoftFault {
    /// Consecutive recovered faults, including this one.
    pub consecutive: u32,
    /// Lifetime recovered faults, including this one.
    pub total: u32,
}

impl fmt::Display for SoftFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recovered soft fault ({} consecutive, {} total)",
            self.consecutive, self.total
        )
    }
}

impl std::error::Error for SoftFault {}

/// Process wide fault counters.
#[derive(Debug, Clone, Copy)]
pub struct SoftFaultCounts {
    pub consecutive: u32,
    pub consecutive_watermark: u32,
    pub total: u32,
}

pub fn soft_fault_counts(clear: bool) -> SoftFaultCounts {
    if clear {
        SoftFaultCounts {
            consecutive: CONSECUTIVE.swap(0, SeqCst),
            consecutive_watermark: CONSECUTIVE_WATERMARK.swap(0, SeqCst),
            total: TOTAL.swap(0, SeqCst),
        }
    } else {
        SoftFaultCounts {
            consecutive: CONSECUTIVE.load(SeqCst),
            consecutive_watermark: CONSECUTIVE_WATERMARK.load(SeqCst),
            total: TOTAL.load(SeqCst),
        }
    }
}

fn raise_watermark(consecutive: u32) {
    let seen = CONSECUTIVE_WATERMARK.load(SeqCst);
    if consecutive > seen {
        // Best effort only.
        let _ = CONSECUTIVE_WATERMARK.compare_exchange(seen, consecutive, SeqCst, SeqCst);
    }
}

fn run_cleanups_to(thread: &Thread, watermark: usize) {
    loop {
        let record = {
            let mut stack = thread.cleanups.borrow_mut();
            if stack.len() <= watermark {
                break;
            }
            stack.pop().expect("cleanup stack shrank below watermark")
        };
        if let Some(cb) = record.cb {
            // The borrow is released above so cleanups may push and pop
            // their own records.
            unsafe { cb(record.arg) }
        }
    }
}

/// Runs `f`, recovering from panics the way the soft error handler
/// recovers from transient hardware faults.
///
/// On a caught panic, cleanups above the scope's watermark run in LIFO
/// order and `Err` is returned, unless recovery is disabled, a poison
/// record is on the stack, or a fault limit is exceeded. In those cases
/// the panic resumes and no cleanup runs, matching the default
/// disposition of a re-raised fault.
pub fn catch_soft_fault<F, R>(f: F) -> Result<R, SoftFault>
where
    F: FnOnce() -> R,
{
    let thread = current();
    if !soft_faults_enabled() {
        return Ok(f());
    }

    assert!(
        !thread.unwind_armed.get(),
        "recoverable scopes do not nest"
    );
    thread.unwind_armed.set(true);
    let watermark = thread.cleanups.borrow().len();
    thread.irrevocable.set(watermark);
    if unlikely!(watermark > CLEANUP_DEPTH_WARNING) {
        log::warn!(
            "thread {} enters recoverable scope with {} cleanups pending",
            thread.id,
            watermark
        );
    }

    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => {
            thread.unwind_armed.set(false);
            thread.irrevocable.set(0);
            let consecutive = CONSECUTIVE.swap(0, SeqCst);
            raise_watermark(consecutive);
            assert_eq!(
                thread.cleanups.borrow().len(),
                watermark,
                "unbalanced cleanups in recoverable scope"
            );
            Ok(value)
        }
        Err(payload) => {
            let consecutive = CONSECUTIVE.fetch_add(1, SeqCst) + 1;
            let total = TOTAL.fetch_add(1, SeqCst) + 1;
            raise_watermark(consecutive);

            let poisoned = thread.cleanups.borrow().iter().any(|c| c.cb.is_none());
            let over_limit = consecutive > MAX_CONSECUTIVE.load(SeqCst)
                || total > MAX_TOTAL.load(SeqCst);
            if poisoned || over_limit {
                thread.unwind_armed.set(false);
                thread.irrevocable.set(0);
                panic::resume_unwind(payload);
            }

            run_cleanups_to(&thread, watermark);
            thread.unwind_armed.set(false);
            thread.irrevocable.set(0);
            Err(SoftFault { consecutive, total })
        }
    }
}

/// Heartbeat and broadcast.

/// Worker heartbeat. Observes the commit barrier (clearing this thread's
/// flag and cycling a read transaction left open at the top level) and
/// drains the broadcast command queue. Drive this from the worker's event
/// loop, roughly every 500 ms.
pub fn tick() {
    let thread = current();
    crate::stm::observe(&thread);
    run_commands(thread.id as usize);
}

fn run_commands(id: usize) {
    let commands: Vec<Command> = std::mem::replace(&mut *COMMANDS[id].lock(), Vec::new());
    for command in commands {
        command()
    }
}

/// Enqueues one command per registered thread other than the caller. The
/// command runs inside the target's next [`tick`]. Returns the number of
/// threads reached.
pub fn broadcast<F>(mut make: F) -> usize
where
    F: FnMut(u32) -> Box<dyn FnOnce() + Send + 'static>,
{
    let self_id = current_id();
    let mut reached = 0;
    for id in 0..THREAD_LIMIT {
        if Some(id as u32) == self_id || !is_registered(id) {
            continue;
        }
        COMMANDS[id].lock().push(make(id as u32));
        reached += 1;
    }
    reached
}

/// True while any registered thread has unprocessed broadcast commands.
pub fn broadcast_pending() -> bool {
    (0..THREAD_LIMIT).any(|id| is_registered(id) && !COMMANDS[id].lock().is_empty())
}

/// Blocks until every broadcast command queue drains.
pub fn broadcast_wait() {
    let backoff = crossbeam_utils::Backoff::new();
    while broadcast_pending() {
        backoff.snooze();
    }
}
