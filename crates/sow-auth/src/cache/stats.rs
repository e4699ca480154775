//! Cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a cache's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a fresh entry
    pub hits: u64,

    /// Upstream fetch (or derivation) attempts
    pub fetches: u64,

    /// Stale values served because a refresh failed
    pub stale_served: u64,

    /// Lookups that ended in an error
    pub failures: u64,
}

impl CacheStats {
    /// Total lookups observed
    pub fn lookups(&self) -> u64 {
        self.hits + self.fetches
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    fetches: AtomicU64,
    stale_served: AtomicU64,
    failures: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stale(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
