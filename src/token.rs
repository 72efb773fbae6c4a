//! Allocation type registry.
//!
//! Every allocation site names a registered type. Registration happens
//! explicitly at process startup through [`register`], which hands back a
//! small copyable [`Token`] carrying the type id, the object size for
//! fixed size types, and whether allocations of the type may be served
//! from the pool. Tokens bind freed memory back to its type for
//! accounting, and ride along in deferred reclamation entries so the
//! reclaimer can free by type without a callback.

use parking_lot::Mutex;
use std::{
    fmt,
    sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed},
};

/// Bound on registered types. Types register once at startup, so the cap
/// doubles as a leak detector for registration in a loop.
pub const TOKEN_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Objects of one known size; `calloc_object` works on these.
    Fixed(u32),
    /// Variable length regions.
    Variable,
}

/// A type declaration handed to [`register`].
#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub name: &'static str,
    pub mode: Mode,
    /// Allocations of this type may be served from pool arenas when the
    /// calling thread allows it.
    pub pool_eligible: bool,
}

/// Opaque 32 bit type id plus cached size and pool eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    id: u32,
    /// Object size for fixed types, 0 for variable.
    size: u32,
    pool: bool,
}

impl Token {
    #[inline]
    pub fn id(self) -> u32 {
        self.id
    }

    /// The object size for fixed size types.
    #[inline]
    pub fn fixed_size(self) -> Option<u32> {
        if self.size > 0 {
            Some(self.size)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn pool_eligible(self) -> bool {
        self.pool
    }
}

struct Registry {
    names: Vec<&'static str>,
}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        // Id 0 stays unregistered so zero initialized tokens are caught
        // by the accounting assertions.
        names: vec!["<invalid>"],
    });
}

/// Registers a type and returns its token. Panics when the type table is
/// full, which is a startup configuration error.
pub fn register(decl: &TypeDecl) -> Token {
    let mut registry = REGISTRY.lock();
    let id = registry.names.len();
    assert!(id < TOKEN_LIMIT, "allocation type table exhausted");
    registry.names.push(decl.name);

    let size = match decl.mode {
        Mode::Fixed(size) => {
            assert!(size > 0, "fixed size types must have a size");
            size
        }
        Mode::Variable => 0,
    };

    Token {
        id: id as u32,
        size,
        pool: decl.pool_eligible,
    }
}

/// Name of a registered type, for diagnostics.
pub fn name(token: Token) -> &'static str {
    let registry = REGISTRY.lock();
    registry
        .names
        .get(token.id as usize)
        .copied()
        .unwrap_or("<invalid>")
}

/// Per type accounting, updated on the system allocator legs of the pool.
pub(crate) struct TokenStats {
    active: AtomicI64,
    total: AtomicU64,
    peak: AtomicI64,
    count_active: AtomicI64,
    count_total: AtomicU64,
    count_peak: AtomicI64,
}

impl TokenStats {
    const fn new() -> Self {
        TokenStats {
            active: AtomicI64::new(0),
            total: AtomicU64::new(0),
            peak: AtomicI64::new(0),
            count_active: AtomicI64::new(0),
            count_total: AtomicU64::new(0),
            count_peak: AtomicI64::new(0),
        }
    }
}

static STATS: [TokenStats; TOKEN_LIMIT] = {
    const S: TokenStats = TokenStats::new();
    [S; TOKEN_LIMIT]
};

/// Applies a byte and object count delta to a token's accounting.
pub(crate) fn account(token: Token, delta: i64, delta_count: i64) {
    assert!(token.id > 0, "uninitialized token");
    let stat = &STATS[token.id as usize];

    let active = stat.active.fetch_add(delta, Relaxed) + delta;
    let count_active = stat.count_active.fetch_add(delta_count, Relaxed) + delta_count;

    if delta > 0 {
        stat.total.fetch_add(delta as u64, Relaxed);
        if active > stat.peak.load(Relaxed) {
            stat.peak.store(active, Relaxed);
        }
    }

    if delta_count > 0 {
        stat.count_total.fetch_add(delta_count as u64, Relaxed);
        if count_active > stat.count_peak.load(Relaxed) {
            stat.count_peak.store(count_active, Relaxed);
        }
    }
}

/// Accounting snapshot for one token.
#[derive(Debug, Clone, Copy)]
pub struct TokenUsage {
    pub active_bytes: i64,
    pub total_bytes: u64,
    pub peak_bytes: i64,
    pub active_count: i64,
    pub total_count: u64,
    pub peak_count: i64,
}

pub fn usage(token: Token) -> TokenUsage {
    let stat = &STATS[token.id as usize];
    TokenUsage {
        active_bytes: stat.active.load(Relaxed),
        total_bytes: stat.total.load(Relaxed),
        peak_bytes: stat.peak.load(Relaxed),
        active_count: stat.count_active.load(Relaxed),
        total_count: stat.count_total.load(Relaxed),
        peak_count: stat.count_peak.load(Relaxed),
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", name(*self), self.id)
    }
}
