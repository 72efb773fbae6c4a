//! Reclamation across threads: active sections hold back dispatch, and
//! typed frees ride the pending table.

use sstm::{pool, smr, thread, token};
use std::sync::{
    atomic::{AtomicUsize, Ordering::SeqCst},
    mpsc,
};

lazy_static::lazy_static! {
    static ref SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
    static ref NODE: token::Token = token::register(&token::TypeDecl {
        name: "smr-e2e:node",
        mode: token::Mode::Fixed(64),
        pool_eligible: false,
    });
}

static FREED: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_free(_: *mut u8) {
    FREED.fetch_add(1, SeqCst);
}

#[test]
fn active_section_holds_back_dispatch() {
    let _serial = SERIAL.lock();
    sstm::init();
    FREED.store(0, SeqCst);

    let (pinned_tx, pinned_rx) = mpsc::channel::<()>();
    let (deferred_tx, deferred_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    crossbeam_utils::thread::scope(|s| {
        // Reader holding a section open.
        s.spawn(move |_| {
            let handle = thread::register(false).unwrap();

            let mut section = smr::Section::new();
            smr::begin(&mut section);
            pinned_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            smr::end(&mut section);

            thread::deregister(handle);
        });

        // Retiring thread.
        s.spawn(move |_| {
            let handle = thread::register(false).unwrap();

            pinned_rx.recv().unwrap();
            unsafe { smr::call(0x9000usize as *mut u8, count_free) };

            // The section predates the shipped table, so nothing can be
            // dispatched yet.
            assert!(!smr::poll());
            assert_eq!(FREED.load(SeqCst), 0);
            deferred_tx.send(()).unwrap();

            // Once the reader leaves, the table quiesces.
            smr::synchronize();
            assert_eq!(FREED.load(SeqCst), 1);

            thread::deregister(handle);
        });

        deferred_rx.recv().unwrap();
        release_tx.send(()).unwrap();
    })
    .unwrap();
}

#[test]
fn double_call_drops_duplicate_across_generations() {
    let _serial = SERIAL.lock();
    // The duplicate deferral logs a double free diagnostic.
    let _ = env_logger::builder().is_test(true).try_init();
    sstm::init();
    FREED.store(0, SeqCst);

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            let handle = thread::register(false).unwrap();

            let target = 0xA000usize as *mut u8;
            unsafe {
                smr::call(target, count_free);
                smr::call(target, count_free);
            }
            smr::synchronize();
            // The duplicate was dropped; the callback ran exactly once.
            assert_eq!(FREED.load(SeqCst), 1);

            // A new generation may retire the same address again.
            unsafe { smr::call(target, count_free) };
            smr::synchronize();
            assert_eq!(FREED.load(SeqCst), 2);

            thread::deregister(handle);
        });
    })
    .unwrap();
}

#[test]
fn free_by_token_returns_memory_to_the_allocator() {
    let _serial = SERIAL.lock();
    sstm::init();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            let handle = thread::register(false).unwrap();

            let before = token::usage(*NODE);
            let node = pool::calloc_object(*NODE);
            assert_eq!(
                token::usage(*NODE).active_count,
                before.active_count + 1
            );

            unsafe { smr::free_by_token(*NODE, node.as_ptr()) };
            // Still accounted until dispatch.
            assert_eq!(
                token::usage(*NODE).active_count,
                before.active_count + 1
            );

            smr::synchronize();
            assert_eq!(token::usage(*NODE).active_count, before.active_count);

            thread::deregister(handle);
        });
    })
    .unwrap();
}
