//! Recoverable fault scopes interacting with the other subsystems: an
//! unwind must leave sections closed, locks released, and the thread
//! usable.

use sstm::{hrlock, smr, stm, thread};
use std::panic::{self, AssertUnwindSafe};

lazy_static::lazy_static! {
    static ref SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
}

static TABLE: hrlock::HrTable = hrlock::HrTable::new();

#[test]
fn fault_inside_read_transaction_recovers() {
    let _serial = SERIAL.lock();
    sstm::init();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            let handle = thread::register(false).unwrap();
            stm::register_thread();
            thread::set_soft_fault_limits(8, 64);
            let _ = thread::soft_fault_counts(true);

            let fault = thread::catch_soft_fault(|| {
                stm::open_read();
                panic!("fault mid transaction");
            });
            assert!(fault.is_err());

            // The unwind closed the section and reset the transaction,
            // so a fresh one opens cleanly and reclamation still works.
            stm::open_read();
            stm::close_read();
            smr::synchronize();

            thread::set_soft_fault_limits(0, 0);
            stm::deregister_thread();
            thread::deregister(handle);
        });
    })
    .unwrap();
}

#[test]
fn fault_under_a_read_lock_releases_it() {
    let _serial = SERIAL.lock();
    sstm::init();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            let handle = thread::register(false).unwrap();
            thread::set_soft_fault_limits(8, 64);
            let _ = thread::soft_fault_counts(true);

            let lock = hrlock::Hrlock::from_seed(33);
            let fault = thread::catch_soft_fault(|| {
                hrlock::read_lock(&lock, &TABLE);
                panic!("fault under the lock");
            });
            assert!(fault.is_err());

            // The cleanup dropped the whole row, so the lock is free.
            assert!(hrlock::read_trylock(&lock, &TABLE));
            hrlock::read_unlock(&lock, &TABLE);

            thread::set_soft_fault_limits(0, 0);
            thread::deregister(handle);
        });
    })
    .unwrap();
}

#[test]
fn fault_inside_write_transaction_reraises() {
    let _serial = SERIAL.lock();
    sstm::init();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            let handle = thread::register(false).unwrap();
            stm::register_thread();
            thread::set_soft_fault_limits(8, 64);
            let _ = thread::soft_fault_counts(true);

            // The write transaction plants a poison record: a fault here
            // must not be swallowed, since unwinding would abandon the
            // commit protocol half way.
            let caught = panic::catch_unwind(AssertUnwindSafe(|| {
                let _ = thread::catch_soft_fault(|| {
                    stm::open_write(false);
                    panic!("fault mid write transaction");
                });
            }));
            assert!(caught.is_err(), "write transaction fault must re-raise");

            thread::set_soft_fault_limits(0, 0);
            // The thread is wedged mid write transaction by design; its
            // slot is abandoned with it.
            drop(handle);
        });
    })
    .unwrap();
}
