//! Concurrency and memory management core for multi-threaded server
//! runtimes.
//!
//! Four co-designed subsystems make up the crate:
//!
//! * [`pool`] - a transactional arena allocator: per-thread bump arenas
//!   reference counted by open transactions and freed wholesale, with a
//!   large-allocation escape hatch tied to arena lifetime.
//! * [`smr`] - safe memory reclamation: reader critical sections, a
//!   deduplicating per-thread pending table, poll based dispatch and a
//!   blocking synchronize.
//! * [`stm`] - single-writer object level software transactional memory:
//!   shadow copies published atomically by a byte flip that a process-wide
//!   barrier propagates to every worker, with shadow buffers released
//!   through [`smr`].
//! * [`hrlock`] - hashed big-reader locks: per `(thread, bucket)` byte
//!   pairs, so read acquisition costs one byte increment on memory no
//!   other reader touches.
//!
//! The [`thread`] registry ties them together: workers register for a
//! dense id that indexes every shared table, carry a cleanup stack used by
//! scoped acquisitions and fault recovery, and drive the whole machine by
//! calling [`thread::tick`] from their event loop.
//!
//! # Examples
//!
//! Registering a worker and running a read transaction:
//!
//! ```
//! sstm::init();
//! let worker = sstm::thread::register(false).unwrap();
//! sstm::stm::register_thread();
//!
//! sstm::stm::open_read();
//! // ... read transactional objects ...
//! sstm::stm::close_read();
//!
//! sstm::stm::deregister_thread();
//! sstm::thread::deregister(worker);
//! ```
//!
//! A pool scope whose allocations die with it:
//!
//! ```
//! use sstm::{pool, token};
//!
//! sstm::init();
//! let worker = sstm::thread::register(false).unwrap();
//! let ty = token::register(&token::TypeDecl {
//!     name: "example:buffer",
//!     mode: token::Mode::Variable,
//!     pool_eligible: true,
//! });
//!
//! let scope = pool::pool_open(true);
//! let buf = pool::malloc(ty, 1024);
//! assert!(pool::is_pool_pointer(buf.as_ptr()));
//! pool::pool_close(scope);
//!
//! sstm::thread::deregister(worker);
//! ```

#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

#[macro_use]
mod internal;

pub mod hrlock;
pub mod pool;
pub mod smr;
pub mod stats;
pub mod stm;
pub mod thread;
pub mod token;

use std::sync::Once;

static INIT: Once = Once::new();

/// Process wide setup: reserves the pool ownership bitmap, calibrates the
/// time source, and enables big-reader write locking (off during single
/// threaded startup). Idempotent.
pub fn init() {
    INIT.call_once(|| {
        internal::bitmap::reserve();
        internal::md::calibrate();
        internal::hook::WRITE_LOCKS.activate();
    });
}

#[cfg(test)]
pub(crate) mod test_util {
    use parking_lot::{Mutex, MutexGuard};

    lazy_static::lazy_static! {
        static ref SERIAL: Mutex<()> = Mutex::new(());
    }

    /// Serializes tests that depend on process-wide quiescence or the
    /// single writer invariant.
    pub fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock()
    }
}
