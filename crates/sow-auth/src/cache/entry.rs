//! Timestamped cache entries and the freshness rules applied to them

use std::time::{Duration, SystemTime};

use crate::config::DEFAULT_CACHE_TTL;

/// A cached value with the time it was fetched
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: T,
    fetched_at: SystemTime,
}

impl<T> CacheEntry<T> {
    /// Stamp a value with its fetch time
    pub fn new(value: T, fetched_at: SystemTime) -> Self {
        Self { value, fetched_at }
    }

    /// The cached value
    pub fn value(&self) -> &T {
        &self.value
    }

    /// When the value was fetched
    pub fn fetched_at(&self) -> SystemTime {
        self.fetched_at
    }

    /// Age at `now`, or `None` if the entry claims to come from the future
    pub fn age(&self, now: SystemTime) -> Option<Duration> {
        now.duration_since(self.fetched_at).ok()
    }

    /// Fresh iff `now - fetched_at < ttl`. Clock going backwards invalidates.
    pub fn is_fresh(&self, now: SystemTime, ttl: Duration) -> bool {
        matches!(self.age(now), Some(age) if age < ttl)
    }
}

/// Freshness and stale-fallback rules of one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Freshness window
    pub ttl: Duration,
    /// How long past the TTL a value may still be served when the provider is
    /// unreachable. `None` serves stale data indefinitely.
    pub max_staleness: Option<Duration>,
}

impl CachePolicy {
    /// Policy with the given TTL and unbounded stale fallback
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_staleness: None,
        }
    }

    /// Bound stale fallback
    pub fn with_max_staleness(mut self, ceiling: Option<Duration>) -> Self {
        self.max_staleness = ceiling;
        self
    }

    /// Whether `entry` exists and is fresh at `now`
    pub fn is_fresh<T>(&self, entry: Option<&CacheEntry<T>>, now: SystemTime) -> bool {
        entry.is_some_and(|e| e.is_fresh(now, self.ttl))
    }

    /// Whether `entry` may be served after a failed refresh
    pub fn allows_stale<T>(&self, entry: &CacheEntry<T>, now: SystemTime) -> bool {
        let Some(ceiling) = self.max_staleness else {
            return true;
        };
        match entry.age(now) {
            Some(age) => age < self.ttl.saturating_add(ceiling),
            None => true,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
