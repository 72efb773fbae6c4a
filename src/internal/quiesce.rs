//! Quiescence tracking for safe memory reclamation.
//!
//! Three pieces cooperate here:
//!
//! - A singleton `EpochClock` holds the current "time". Shipping a batch of
//!   deferred destruction ticks the clock.
//! - Each registered thread owns a `ThreadEpoch` holding the "time" it
//!   started reading at, or an inactive sentinel outside critical sections.
//! - `QuiesceEpoch` is the unsynchronized value both exchange.
//!
//! A batch sealed at epoch `e` is reclaimable once every thread's epoch is
//! greater than `e`. A thread that is inactive trivially qualifies because
//! the inactive sentinel compares greater than every real epoch. Threads
//! running destructors pin themselves at a collect sentinel that is also
//! greater than every real epoch, so collection never blocks itself while
//! still counting as active to onlookers.

use core::num::NonZeroUsize;
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

type Storage = usize;

/// A `ThreadEpoch` holds this when the owning thread is outside all
/// critical sections. Conveniently greater than every other epoch.
const INACTIVE: Storage = !0;

/// Pinned by threads while they run deferred destructors. Active, but
/// greater than any epoch the clock can reach.
const COLLECT: Storage = !0 - 1;

/// The beginning of time.
const FIRST: Storage = 1;

/// NonZero representation of epochs, so `Option<QuiesceEpoch>` stays one
/// word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuiesceEpoch(NonZeroUsize);

impl QuiesceEpoch {
    /// It is a logic error to pass in 0.
    #[inline]
    unsafe fn new_unchecked(epoch: Storage) -> Self {
        debug_assert!(epoch >= FIRST, "epoch before the start of time");
        QuiesceEpoch(NonZeroUsize::new_unchecked(epoch))
    }

    /// Returns true if self is not the inactive sentinel.
    #[inline]
    pub fn is_active(self) -> bool {
        self.0.get() != INACTIVE
    }

    /// Greater than any epoch a batch can be sealed with. Useful as the
    /// seed of a minimum scan.
    #[inline]
    pub fn max_value() -> Self {
        unsafe { QuiesceEpoch::new_unchecked(INACTIVE) }
    }
}

/// The most recent epoch the owning thread may be reading from, or
/// `INACTIVE`.
#[derive(Debug)]
pub struct ThreadEpoch(AtomicUsize);

impl ThreadEpoch {
    #[inline]
    pub const fn inactive() -> Self {
        ThreadEpoch(AtomicUsize::new(INACTIVE))
    }

    /// Gets the pinned epoch, or the inactive sentinel.
    #[inline]
    pub fn get(&self, o: Ordering) -> QuiesceEpoch {
        // The only values ever stored are epochs and the sentinels, all
        // nonzero.
        unsafe { QuiesceEpoch::new_unchecked(self.0.load(o)) }
    }

    #[inline]
    pub fn is_active(&self, o: Ordering) -> bool {
        self.get(o).is_active()
    }

    /// True if the owning thread can no longer be reading anything that
    /// existed at `epoch`.
    #[inline]
    pub fn is_quiesced(&self, epoch: QuiesceEpoch, o: Ordering) -> bool {
        self.get(o) > epoch
    }

    /// Pins the thread at `epoch`. Requires self to be inactive.
    #[inline]
    pub fn pin(&self, epoch: QuiesceEpoch, o: Ordering) {
        debug_assert!(
            !self.is_active(Ordering::Relaxed),
            "pinning an already active ThreadEpoch"
        );
        debug_assert!(epoch.is_active(), "cannot pin to the inactive sentinel");
        self.0.store(epoch.0.get(), o);
    }

    /// Unpins the thread, returning it to the inactive sentinel.
    #[inline]
    pub fn unpin(&self, o: Ordering) {
        debug_assert!(
            self.is_active(Ordering::Relaxed),
            "unpinning an inactive ThreadEpoch"
        );
        self.0.store(INACTIVE, o);
    }

    /// Pins the thread at the collect sentinel for the duration of
    /// deferred destructor execution.
    #[inline]
    pub fn pin_collect(&self, o: Ordering) {
        debug_assert!(
            !self.is_active(Ordering::Relaxed),
            "collecting from inside a critical section"
        );
        self.0.store(COLLECT, o);
    }

    /// Spins until the owning thread quiesces past `epoch`.
    ///
    /// The caller must be a different thread, or self must be inactive,
    /// else deadlock.
    #[inline(never)]
    #[cold]
    pub fn wait_until_quiesced(&self, epoch: QuiesceEpoch) {
        let backoff = Backoff::new();
        while !self.is_quiesced(epoch, Ordering::Acquire) {
            backoff.snooze();
        }
    }
}

/// A monotonically increasing clock.
#[derive(Debug)]
#[repr(align(64))]
pub struct EpochClock(AtomicUsize);

/// The world clock. Ticked once per shipped reclamation batch.
pub static CLOCK: EpochClock = EpochClock(AtomicUsize::new(FIRST));

impl EpochClock {
    /// Returns the current epoch.
    #[inline]
    pub fn now(&self) -> QuiesceEpoch {
        // Acquire pairs with the Release tick so a thread that pins `now`
        // sees every unlink performed before the batch it might observe
        // was sealed.
        unsafe { QuiesceEpoch::new_unchecked(self.0.load(Ordering::Acquire)) }
    }

    /// Increments the clock and returns the previous epoch.
    ///
    /// Overflow would take centuries of continuous shipping on 64 bit
    /// platforms, and registration is capped well below the thread counts
    /// that could make the final increment race.
    #[inline]
    pub fn fetch_and_tick(&self) -> QuiesceEpoch {
        let prev = self.0.fetch_add(1, Ordering::Release);
        debug_assert!(prev < COLLECT - 1, "epoch clock overflow");
        unsafe { QuiesceEpoch::new_unchecked(prev) }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

    #[test]
    fn clock_monotone() {
        let a = CLOCK.fetch_and_tick();
        let b = CLOCK.fetch_and_tick();
        assert!(b > a);
        assert!(CLOCK.now() > b);
    }

    #[test]
    fn pin_orders_against_seals() {
        let epoch = ThreadEpoch::inactive();
        assert!(!epoch.is_active(Relaxed));

        let sealed = CLOCK.fetch_and_tick();
        epoch.pin(CLOCK.now(), Release);
        assert!(epoch.is_active(Relaxed));

        // The reader began after the seal, so the batch is quiesced with
        // respect to it.
        assert!(epoch.is_quiesced(sealed, Acquire));

        // A batch sealed while pinned is not.
        let newer = CLOCK.fetch_and_tick();
        assert!(!epoch.is_quiesced(newer, Acquire));

        epoch.unpin(Release);
        assert!(epoch.is_quiesced(newer, Acquire));
    }

    #[test]
    fn collect_sentinel_is_active_and_quiesced() {
        let epoch = ThreadEpoch::inactive();
        epoch.pin_collect(Release);
        assert!(epoch.is_active(Relaxed));
        let sealed = CLOCK.fetch_and_tick();
        assert!(epoch.is_quiesced(sealed, Acquire));
        epoch.unpin(Release);
    }
}
