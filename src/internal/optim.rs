//! Branch weight hints for hot paths.
//!
//! These compile down to a call to an empty `#[cold]` function on the
//! unexpected side of the branch, which is enough to steer block layout on
//! every supported backend.

#[doc(hidden)]
#[cold]
pub fn _cold_path() {}

#[doc(hidden)]
#[inline(always)]
pub fn _likely(b: bool) -> bool {
    if !b {
        _cold_path()
    }
    b
}

#[doc(hidden)]
#[inline(always)]
pub fn _unlikely(b: bool) -> bool {
    if b {
        _cold_path()
    }
    b
}

macro_rules! likely {
    ($e:expr) => {{
        $crate::internal::optim::_likely($e)
    }};
}

macro_rules! unlikely {
    ($e:expr) => {{
        $crate::internal::optim::_unlikely($e)
    }};
}
