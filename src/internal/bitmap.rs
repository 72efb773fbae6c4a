//! Pool ownership bitmap.
//!
//! One bit per `GRANULE` (1 MiB) of virtual address space. Bit set means
//! the aligned region is owned by the pool allocator, either as part of an
//! arena or as a large allocation. `free` consults this to decide whether a
//! pointer goes back to the system allocator or is arena memory that will be
//! released wholesale.
//!
//! x86_64 only uses 48 bits of virtual address, so the table covers
//! `2^48 / GRANULE` bits. At the 1 MiB granule that is 32 MiB of table,
//! allocated zeroed so untouched pages stay copy-on-write mappings of the
//! zero page.

use std::{
    alloc::{alloc_zeroed, Layout},
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

const VMA_BITS: u32 = 48;

pub const GRANULE_SHIFT: u32 = 20;
pub const GRANULE: usize = 1 << GRANULE_SHIFT;

const N_BITS: usize = 1 << (VMA_BITS - GRANULE_SHIFT);
const N_WORDS: usize = N_BITS / 64;

struct OwnershipMap {
    words: &'static [AtomicU64],
}

// The table is a plain array of atomics.
unsafe impl Sync for OwnershipMap {}

lazy_static::lazy_static! {
    static ref MAP: OwnershipMap = {
        let layout = Layout::array::<AtomicU64>(N_WORDS).expect("bitmap layout");
        // AtomicU64 is transparent over u64 and all zeroes is a valid
        // initial state.
        let base = unsafe { alloc_zeroed(layout) } as *mut AtomicU64;
        assert!(!base.is_null(), "ownership bitmap allocation failed");
        OwnershipMap {
            words: unsafe { std::slice::from_raw_parts(base, N_WORDS) },
        }
    };
}

/// Forces the lazy table into existence.
pub fn reserve() {
    let _ = MAP.words.len();
}

#[inline]
fn locate(addr: usize) -> (usize, u64) {
    let bit = addr >> GRANULE_SHIFT;
    debug_assert!(bit < N_BITS, "address outside the usable VMA range");
    (bit / 64, 1u64 << (bit % 64))
}

/// Marks every granule overlapped by `[addr, addr + bytes)` as pool owned.
/// `addr` must be granule aligned and the bits must currently be clear.
pub fn set(addr: usize, bytes: usize) {
    debug_assert_eq!(addr % GRANULE, 0, "unaligned pool region");

    let mut offset = 0;
    while offset < bytes.max(1) {
        let (word, mask) = locate(addr + offset);
        let prev = MAP.words[word].fetch_or(mask, Relaxed);
        debug_assert_eq!(prev & mask, 0, "pool region marked twice");
        offset += GRANULE;
    }
}

/// Clears the granule bits of a region previously passed to `set`.
pub fn clear(addr: usize, bytes: usize) {
    debug_assert_eq!(addr % GRANULE, 0, "unaligned pool region");

    let mut offset = 0;
    while offset < bytes.max(1) {
        let (word, mask) = locate(addr + offset);
        let prev = MAP.words[word].fetch_and(!mask, Relaxed);
        debug_assert_ne!(prev & mask, 0, "pool region cleared twice");
        offset += GRANULE;
    }
}

/// True iff the granule containing `addr` is pool owned.
#[inline]
pub fn test(addr: usize) -> bool {
    let (word, mask) = locate(addr);
    MAP.words[word].load(Relaxed) & mask != 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_test_clear() {
        // A fake address nothing else in the process will ever map.
        let addr = 41usize << GRANULE_SHIFT;
        assert!(!test(addr));
        set(addr, 1);
        assert!(test(addr));
        assert!(test(addr + GRANULE - 1));
        assert!(!test(addr + GRANULE));
        clear(addr, 1);
        assert!(!test(addr));
    }

    #[test]
    fn multi_granule_region() {
        let addr = 77usize << GRANULE_SHIFT;
        let bytes = 3 * GRANULE;
        set(addr, bytes);
        for i in 0..3 {
            assert!(test(addr + i * GRANULE));
        }
        assert!(!test(addr + 3 * GRANULE));
        clear(addr, bytes);
        for i in 0..3 {
            assert!(!test(addr + i * GRANULE));
        }
    }
}
