//! Reader and writer contention on a shared lock table.

use sstm::{hrlock, thread};
use std::{
    sync::atomic::{AtomicBool, Ordering::SeqCst},
    time::Duration,
};

lazy_static::lazy_static! {
    static ref SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
}

static TABLE: hrlock::HrTable = hrlock::HrTable::new();

static READER_HOLDS: AtomicBool = AtomicBool::new(false);
static WRITER_TRYING: AtomicBool = AtomicBool::new(false);
static READER_RELEASED: AtomicBool = AtomicBool::new(false);
static WRITER_DONE: AtomicBool = AtomicBool::new(false);

#[test]
fn writer_waits_for_reader() {
    let _serial = SERIAL.lock();
    sstm::init();
    READER_HOLDS.store(false, SeqCst);
    WRITER_TRYING.store(false, SeqCst);
    READER_RELEASED.store(false, SeqCst);
    WRITER_DONE.store(false, SeqCst);

    let lock = hrlock::Hrlock::new();

    crossbeam_utils::thread::scope(|s| {
        let lock = &lock;

        s.spawn(move |_| {
            let handle = thread::register(false).unwrap();

            hrlock::read_lock(lock, &TABLE);
            READER_HOLDS.store(true, SeqCst);

            // Give the writer time to start its column sweep, then let
            // it through.
            while !WRITER_TRYING.load(SeqCst) {
                std::hint::spin_loop();
            }
            std::thread::sleep(Duration::from_millis(20));
            READER_RELEASED.store(true, SeqCst);
            hrlock::read_unlock(lock, &TABLE);

            // After the writer finishes, reads succeed again.
            while !WRITER_DONE.load(SeqCst) {
                std::hint::spin_loop();
            }
            assert!(hrlock::read_trylock(lock, &TABLE));
            hrlock::read_unlock(lock, &TABLE);

            thread::deregister(handle);
        });

        s.spawn(move |_| {
            let handle = thread::register(false).unwrap();

            while !READER_HOLDS.load(SeqCst) {
                std::hint::spin_loop();
            }
            WRITER_TRYING.store(true, SeqCst);
            hrlock::write_lock(lock, &TABLE);
            // The sweep cannot complete until the reader dropped its
            // row byte.
            assert!(READER_RELEASED.load(SeqCst));
            hrlock::write_unlock(lock, &TABLE);
            WRITER_DONE.store(true, SeqCst);

            thread::deregister(handle);
        });
    })
    .unwrap();
}

#[test]
fn read_timeout_expires_under_a_writer() {
    let _serial = SERIAL.lock();
    sstm::init();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            let handle = thread::register(false).unwrap();
            let lock = hrlock::Hrlock::from_seed(21);

            hrlock::write_lock(&lock, &TABLE);

            // Zero timeout declines immediately.
            assert!(!hrlock::read_trylock(&lock, &TABLE));

            // A bounded wait gives up once the deadline passes.
            let start = std::time::Instant::now();
            assert!(!hrlock::read_lock_timeout(&lock, &TABLE, 10_000));
            assert!(start.elapsed() >= Duration::from_millis(5));

            hrlock::write_unlock(&lock, &TABLE);
            assert!(hrlock::read_trylock(&lock, &TABLE));
            hrlock::read_unlock(&lock, &TABLE);

            thread::deregister(handle);
        });
    })
    .unwrap();
}
