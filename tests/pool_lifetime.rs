//! Arena lifetime across overlapping transactions, and the ownership
//! bitmap round trip.

use sstm::{pool, smr, thread, token};

lazy_static::lazy_static! {
    static ref SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
    static ref BUFFER: token::Token = token::register(&token::TypeDecl {
        name: "pool-e2e:buffer",
        mode: token::Mode::Variable,
        pool_eligible: true,
    });
}

const MIB: usize = 1 << 20;

fn on_worker(f: impl FnOnce() + Send) {
    let _serial = SERIAL.lock();
    sstm::init();
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

/// Bump `total` bytes in sub-threshold chunks so everything stays on the
/// arena path.
fn bump_bytes(total: usize) {
    let chunk = 2 * MIB;
    let mut done = 0;
    while done < total {
        let n = chunk.min(total - done);
        let p = pool::malloc(*BUFFER, n);
        assert!(pool::is_pool_pointer(p.as_ptr()));
        done += n;
    }
}

#[test]
fn lifetime_across_overlapping_transactions() {
    on_worker(|| {
        pool::restore_state(pool::MallocState {
            pool_enabled: true,
            pool_allowed: true,
        });

        // T1 opens the first arena.
        let t1 = pool::transaction_open();
        assert_eq!(t1.ref_count(), 1);
        assert_eq!(pool::open_epochs(), 1);

        bump_bytes(10 * MIB);

        // T2 is still created against the same arena.
        let t2 = pool::transaction_open();
        assert_eq!(t2, t1);
        assert_eq!(t1.ref_count(), 2);

        // Filling the arena spawns a fresh one with refcount zero; both
        // transactions keep their count on the old arena.
        bump_bytes(24 * MIB);
        assert_eq!(pool::open_epochs(), 2);

        // Closing T1 leaves the head arena pinned by T2, so the cleanup
        // loop stops at it.
        pool::transaction_close(t1);
        assert_eq!(t2.ref_count(), 1);
        let p = pool::malloc(*BUFFER, 16);
        assert!(pool::is_pool_pointer(p.as_ptr()));
        assert_eq!(pool::open_epochs(), 2);

        // Closing T2 drops the head refcount to zero; the next open
        // retires both fully closed arenas and starts fresh.
        pool::transaction_close(t2);
        let t3 = pool::transaction_open();
        assert_eq!(pool::open_epochs(), 1);
        assert_eq!(t3.ref_count(), 1);
        pool::transaction_close(t3);

        pool::restore_state(pool::MallocState::default());
    });
}

#[test]
fn pool_scope_round_trip_clears_ownership() {
    on_worker(|| {
        // Disable the arena cache so destruction returns memory to the
        // system and clears the ownership bits.
        pool::set_reclaimed_epochs_limit(0);

        let scope = pool::pool_open(true);
        let x = pool::malloc(*BUFFER, 4096);
        let addr = x.as_ptr();
        assert!(pool::is_pool_pointer(addr));
        pool::pool_close(scope);

        smr::synchronize();
        assert!(!pool::is_pool_pointer(addr));

        pool::set_reclaimed_epochs_limit(8);
    });
}

#[test]
fn adopted_cleanups_run_at_destruction() {
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    static RAN: AtomicUsize = AtomicUsize::new(0);

    unsafe fn mark(_: *mut u8) {
        RAN.fetch_add(1, Relaxed);
    }

    on_worker(|| {
        RAN.store(0, Relaxed);
        pool::set_reclaimed_epochs_limit(0);

        let scope = pool::pool_open(true);
        unsafe { pool::adopt(mark, std::ptr::null_mut(), scope.epoch()) };
        pool::pool_close(scope);
        assert_eq!(RAN.load(Relaxed), 0, "cleanup ran before the arena died");

        smr::synchronize();
        assert_eq!(RAN.load(Relaxed), 1);

        pool::set_reclaimed_epochs_limit(8);
    });
}

#[test]
fn large_allocation_dies_with_its_arena() {
    on_worker(|| {
        pool::set_reclaimed_epochs_limit(0);

        let scope = pool::pool_open(true);
        let big = pool::malloc(*BUFFER, pool::LARGE_ALLOC_THRESHOLD + MIB);
        let big_addr = big.as_ptr();
        assert!(pool::is_pool_pointer(big_addr));
        assert_eq!(big_addr as usize % pool::EPOCH_ALIGNMENT, 0);

        // Freeing a pool owned pointer is a no-op.
        unsafe { pool::free(*BUFFER, big_addr) };
        assert!(pool::is_pool_pointer(big_addr));

        pool::pool_close(scope);
        smr::synchronize();
        assert!(!pool::is_pool_pointer(big_addr));

        pool::set_reclaimed_epochs_limit(8);
    });
}

#[test]
fn system_leg_accounts_against_the_token() {
    on_worker(|| {
        let before = token::usage(*BUFFER);
        let p = pool::malloc_flags(
            *BUFFER,
            4096,
            pool::AllocFlags { non_pool: true },
        );
        let during = token::usage(*BUFFER);
        assert!(during.active_bytes >= before.active_bytes + 4096);
        assert_eq!(during.active_count, before.active_count + 1);

        unsafe { pool::free(*BUFFER, p.as_ptr()) };
        let after = token::usage(*BUFFER);
        assert_eq!(after.active_count, before.active_count);
    });
}
