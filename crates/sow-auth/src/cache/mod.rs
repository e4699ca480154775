//! Cache building blocks shared by the discovery, JWKS and public key caches
//!
//! - [`CacheEntry`] - a value stamped with the time it was fetched
//! - [`CachePolicy`] - TTL and optional staleness ceiling
//! - [`Clock`] - injectable time source
//! - [`CacheStats`] - hit/fetch/stale/failure counters
//! - `SingleFlight` - collapses concurrent misses into one fetch

mod clock;
mod entry;
mod singleflight;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, CachePolicy};
pub use stats::CacheStats;

pub(crate) use singleflight::SingleFlight;
pub(crate) use stats::CacheCounters;
