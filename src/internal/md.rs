//! Machine dependent time source.
//!
//! Timeouts in this crate are expressed in microseconds at the API and
//! translated once into raw tick units for the spin loops that check them.
//! On x86_64 a tick is one TSC cycle, read with `rdtsc` and calibrated
//! against the OS clock the first time a conversion is requested. Elsewhere
//! a tick is one nanosecond from a monotonic clock.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Current tick count. Monotonic enough for timeout arithmetic.
        #[inline]
        pub fn ticks() -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }

        fn ticks_per_us() -> u64 {
            use std::time::{Duration, Instant};

            lazy_static::lazy_static! {
                static ref TICKS_PER_US: u64 = {
                    // One short calibration against the wall clock. A busy
                    // wait keeps the core out of low frequency states.
                    let start = Instant::now();
                    let first = ticks();
                    while start.elapsed() < Duration::from_millis(5) {
                        std::hint::spin_loop();
                    }
                    let elapsed_us = start.elapsed().as_micros() as u64;
                    let delta = ticks().wrapping_sub(first);
                    (delta / elapsed_us.max(1)).max(1)
                };
            }

            *TICKS_PER_US
        }
    } else {
        use std::time::Instant;

        lazy_static::lazy_static! {
            static ref EPOCH: Instant = Instant::now();
        }

        /// Current tick count. Monotonic enough for timeout arithmetic.
        #[inline]
        pub fn ticks() -> u64 {
            EPOCH.elapsed().as_nanos() as u64
        }

        fn ticks_per_us() -> u64 {
            1_000
        }
    }
}

/// Translates a microsecond timeout into ticks, saturating on overflow so
/// that "practically forever" stays forever.
#[inline]
pub fn us_to_ticks(us: u64) -> u64 {
    us.saturating_mul(ticks_per_us())
}

/// Forces the one time calibration. Called from `init` so the first timed
/// lock acquisition does not pay for it.
pub fn calibrate() {
    let _ = us_to_ticks(1);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ticks_advance() {
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
    }

    #[test]
    fn conversion_saturates() {
        assert_eq!(us_to_ticks(u64::max_value()), u64::max_value());
        assert!(us_to_ticks(1) >= 1);
        assert!(us_to_ticks(1_000) >= us_to_ticks(1));
    }
}
