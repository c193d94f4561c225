//! TTL-bounded geocode cache on top of a [`KeyValueStore`].
//!
//! The whole address map lives under [`CACHE_KEY`]. Keys are normalized
//! addresses (trimmed, lower-cased, inner whitespace collapsed). Entries past
//! `expiresAt` are invisible to readers and only dropped physically by
//! [`CacheStore::clean_expired`] or the next write.
//!
//! Older stores hold bare `{lat, lng}` values or entries without an expiry;
//! both are migrated on read with a fresh TTL.

use super::store::KeyValueStore;
use super::types::{CacheEntry, CacheStats, Coordinates, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Storage key holding the address map.
pub const CACHE_KEY: &str = "geocodeCache";

/// Default entry lifetime: 30 days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Cache size above which cleanup logs a warning.
pub const DEFAULT_SIZE_WARNING_BYTES: u64 = 5 * 1024 * 1024;

/// Normalize an address into its cache key.
pub fn normalize_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// On-disk shapes an entry may have.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Current(CacheEntry),
    Unstamped { coords: Coordinates },
    Legacy(Coordinates),
}

/// Live entries of the cache at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheSnapshot {
    /// Look up an address; the address is normalized first.
    pub fn get(&self, address: &str) -> Option<&CacheEntry> {
        self.entries.get(&normalize_key(address))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, CacheEntry> {
        self.entries.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, CacheEntry> {
        self.entries
    }
}

/// What a decode pass found in the raw stored map.
#[derive(Debug, Default)]
struct Decoded {
    live: BTreeMap<String, CacheEntry>,
    expired: usize,
    migrated: usize,
    invalid: usize,
}

impl Decoded {
    fn is_clean(&self) -> bool {
        self.expired == 0 && self.migrated == 0 && self.invalid == 0
    }
}

/// Result of [`CacheStore::clean_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub migrated: usize,
    pub remaining: usize,
    pub rewritten: bool,
}

/// The geocode cache. Sole owner of the stored address map.
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    ttl_ms: i64,
    size_warning_bytes: u64,
    write_lock: tokio::sync::Mutex<()>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            ttl_ms: DEFAULT_TTL.as_millis() as i64,
            size_warning_bytes: DEFAULT_SIZE_WARNING_BYTES,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn with_size_warning(mut self, bytes: u64) -> Self {
        self.size_warning_bytes = bytes;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.max(0) as u64)
    }

    fn decode(&self, raw: Option<Value>, now: i64) -> Decoded {
        let mut out = Decoded::default();
        let map = match raw {
            None | Some(Value::Null) => return out,
            Some(Value::Object(map)) => map,
            Some(other) => {
                log::warn!("Geocode cache has unexpected shape, ignoring it: {}", other);
                return out;
            }
        };

        for (raw_key, value) in map {
            let key = normalize_key(&raw_key);
            let mut migrated = key != raw_key;
            let entry = match serde_json::from_value::<StoredEntry>(value) {
                Ok(StoredEntry::Current(entry)) => entry,
                Ok(StoredEntry::Unstamped { coords }) | Ok(StoredEntry::Legacy(coords)) => {
                    migrated = true;
                    CacheEntry {
                        coords,
                        cached_at: now,
                        expires_at: now.saturating_add(self.ttl_ms),
                    }
                }
                Err(e) => {
                    log::debug!("Dropping unreadable cache entry '{}': {}", raw_key, e);
                    out.invalid += 1;
                    continue;
                }
            };
            if !entry.is_live(now) {
                out.expired += 1;
                continue;
            }
            if migrated {
                out.migrated += 1;
            }
            match out.live.entry(key) {
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
                btree_map::Entry::Occupied(mut slot) => {
                    // Two raw keys normalized to the same address: keep the fresher one.
                    if entry.expires_at > slot.get().expires_at {
                        slot.insert(entry);
                    }
                }
            }
        }
        out
    }

    async fn read(&self, now: i64) -> Result<Decoded, StoreError> {
        let raw = self.store.get(CACHE_KEY).await?;
        Ok(self.decode(raw, now))
    }

    async fn write(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<(), StoreError> {
        self.store.set(CACHE_KEY, serde_json::to_value(entries)?).await
    }

    /// All live entries. Never writes to the store.
    pub async fn load(&self) -> Result<CacheSnapshot, StoreError> {
        self.load_at(now_ms()).await
    }

    pub(crate) async fn load_at(&self, now: i64) -> Result<CacheSnapshot, StoreError> {
        let decoded = self.read(now).await?;
        Ok(CacheSnapshot { entries: decoded.live })
    }

    /// Single live entry for `address`, if any.
    pub async fn get(&self, address: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut snapshot = self.load().await?.into_inner();
        Ok(snapshot.remove(&normalize_key(address)))
    }

    /// Write (or refresh) the entry for `address`, keeping all other live entries.
    pub async fn save(&self, address: &str, coords: Coordinates) -> Result<(), StoreError> {
        self.save_at(address, coords, now_ms()).await
    }

    pub(crate) async fn save_at(
        &self,
        address: &str,
        coords: Coordinates,
        now: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read(now).await?.live;
        entries.insert(
            normalize_key(address),
            CacheEntry {
                coords,
                cached_at: now,
                expires_at: now.saturating_add(self.ttl_ms),
            },
        );
        self.write(&entries).await
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(CACHE_KEY).await
    }

    /// Live entry count and stored size.
    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let count = self.load().await?.len();
        let size_bytes = self.store.bytes_in_use(CACHE_KEY).await?;
        Ok(CacheStats { count, size_bytes })
    }

    /// Rewrite the store with live entries only. No write happens when
    /// nothing is expired, migrated or unreadable.
    pub async fn clean_expired(&self) -> Result<CleanupReport, StoreError> {
        self.clean_expired_at(now_ms()).await
    }

    pub(crate) async fn clean_expired_at(&self, now: i64) -> Result<CleanupReport, StoreError> {
        let _guard = self.write_lock.lock().await;
        let decoded = self.read(now).await?;
        let report = CleanupReport {
            removed: decoded.expired + decoded.invalid,
            migrated: decoded.migrated,
            remaining: decoded.live.len(),
            rewritten: !decoded.is_clean(),
        };
        if report.rewritten {
            self.write(&decoded.live).await?;
            log::info!(
                "Geocode cache cleanup: removed {}, migrated {}, kept {}",
                report.removed,
                report.migrated,
                report.remaining
            );
        }

        let bytes = self.store.bytes_in_use(CACHE_KEY).await?;
        log::debug!(
            "Geocode cache: {} addresses, {:.2} KB",
            report.remaining,
            bytes as f64 / 1024.0
        );
        if bytes > self.size_warning_bytes {
            log::warn!(
                "Geocode cache is {:.1} MB, above the {:.1} MB warning size; consider clearing it",
                bytes as f64 / (1024.0 * 1024.0),
                self.size_warning_bytes as f64 / (1024.0 * 1024.0)
            );
        }
        Ok(report)
    }
}
