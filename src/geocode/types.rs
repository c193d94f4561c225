//! Core types for the geocoding subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A resolved position.
///
/// `approximate` marks coordinates that were only resolved at city or
/// postal-code granularity and must be shown as such.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub approximate: bool,
}

impl Coordinates {
    pub fn precise(lat: f64, lng: f64) -> Self {
        Self { lat, lng, approximate: false }
    }

    pub fn approximate(lat: f64, lng: f64) -> Self {
        Self { lat, lng, approximate: true }
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5}, {:.5}", self.lat, self.lng)?;
        if self.approximate {
            write!(f, " (approx.)")?;
        }
        Ok(())
    }
}

/// A stored cache entry. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub coords: Coordinates,
    /// Absent in some older stores; only `expires_at` decides liveness.
    #[serde(default)]
    pub cached_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// A listing as handed over by the page scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    /// Any further scraped fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RestaurantItem {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            address: address.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A listing after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedItem {
    #[serde(flatten)]
    pub item: RestaurantItem,
    pub coords: Option<Coordinates>,
    pub from_cache: bool,
    /// Position of the item in the batch input.
    #[serde(skip)]
    pub index: usize,
}

/// Cache introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub count: usize,
    pub size_bytes: u64,
}

impl CacheStats {
    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }
}

/// Advisory events surfaced to the caller while a lookup or batch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeocodeNotice {
    /// The upstream service answered 429; the resolver pauses before moving on.
    RateLimited {
        #[serde(with = "duration_ms")]
        wait: Duration,
    },
    /// Some, but not all, items of a batch stayed unresolved.
    PartialFailure { failed: usize, total: usize },
    /// No item of a non-empty batch could be resolved.
    CompleteFailure { total: usize },
}

impl fmt::Display for GeocodeNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { wait } => write!(
                f,
                "Geocoding service rate limit reached. Waiting {:.1} seconds before continuing...",
                wait.as_secs_f64()
            ),
            Self::PartialFailure { failed, total } => write!(
                f,
                "{} of {} addresses could not be located. This is normal for unusual address formats.",
                failed, total
            ),
            Self::CompleteFailure { .. } => write!(
                f,
                "Unable to locate any restaurant addresses. The geocoding service may be unavailable; try again later."
            ),
        }
    }
}

/// Receives [`GeocodeNotice`]s. Shared between the resolver and the batch session.
pub type NoticeSink = Arc<dyn Fn(&GeocodeNotice) + Send + Sync>;

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Failures of the persistent key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures of a single request against the geocoding endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("rate limited by the geocoding service")]
    RateLimited,
    #[error("geocoding service answered HTTP {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors that escape the batch orchestrator. Store and transport failures
/// are absorbed and logged, so only cancellation is left.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding run was cancelled")]
    Cancelled,
}
