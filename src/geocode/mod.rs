//! Address resolution: a tiered Nominatim geocoder over a persistent TTL cache.
//!
//! Flow: BatchSession → CacheStore (lookup) → Resolver → QueryBuilder →
//! GeocodeTransport → CacheStore (write-through).

pub mod batch;
pub mod cache;
pub mod providers;
pub mod query;
pub mod resolver;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{cancel_on, BatchPlan, BatchProgress, BatchSession};
pub use cache::{normalize_key, CacheSnapshot, CacheStore, CleanupReport};
pub use providers::{GeocodeTransport, NominatimTransport, SearchHit};
pub use query::{GeocodeQuery, QueryBuilder, Tier};
pub use resolver::{Resolution, Resolver};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use types::{
    CacheEntry, CacheStats, Coordinates, GeocodeError, GeocodeNotice, NoticeSink, ResolvedItem,
    RestaurantItem, StoreError, TransportError,
};
