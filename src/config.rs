//! Geocoder settings at ~/.lokalkarte/config.json.
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use crate::geocode::batch::BatchSession;
use crate::geocode::cache::CacheStore;
use crate::geocode::providers::{GeocodeTransport, NominatimTransport, NOMINATIM_SEARCH_URL};
use crate::geocode::query::{QueryBuilder, DEFAULT_AMENITY_FALLBACKS};
use crate::geocode::resolver::Resolver;
use crate::geocode::store::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub user_agent: String,
    /// ISO 3166-1 alpha-2; empty searches worldwide.
    pub country_code: String,
    pub cache_ttl_days: u64,
    pub rate_limit_ms: u64,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub amenity_fallbacks: Vec<String>,
    /// Try the city-only query (approximate result) when everything else missed.
    pub city_fallback: bool,
    /// Uncached addresses from which a run needs confirmation.
    pub usage_warning_threshold: usize,
    pub cache_size_warning_mb: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            endpoint: NOMINATIM_SEARCH_URL.to_string(),
            user_agent: format!("Lokalkarte/{}", env!("CARGO_PKG_VERSION")),
            country_code: "at".to_string(),
            cache_ttl_days: 30,
            rate_limit_ms: 1100,
            retry_delay_ms: 200,
            request_timeout_ms: 10_000,
            amenity_fallbacks: DEFAULT_AMENITY_FALLBACKS.iter().map(|s| s.to_string()).collect(),
            city_fallback: true,
            usage_warning_threshold: 100,
            cache_size_warning_mb: 5,
        }
    }
}

impl GeocoderConfig {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lokalkarte")
            .join("config.json")
    }

    /// Read `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_days * 24 * 3600)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn transport(&self) -> NominatimTransport {
        NominatimTransport::new(&self.endpoint, &self.user_agent)
            .with_country(&self.country_code)
            .with_timeout(Duration::from_millis(self.request_timeout_ms))
    }

    pub fn query_builder(&self) -> QueryBuilder {
        QueryBuilder::new(self.amenity_fallbacks.clone(), self.city_fallback)
    }

    pub fn resolver(&self, transport: Arc<dyn GeocodeTransport>) -> Resolver {
        Resolver::new(transport)
            .with_queries(self.query_builder())
            .with_delays(self.retry_delay(), self.rate_limit())
    }

    pub fn cache(&self, store: Arc<dyn KeyValueStore>) -> CacheStore {
        CacheStore::new(store)
            .with_ttl(self.ttl())
            .with_size_warning(self.cache_size_warning_mb * 1024 * 1024)
    }

    /// A fresh session over `cache` and `resolver`.
    pub fn session(&self, cache: Arc<CacheStore>, resolver: Arc<Resolver>) -> BatchSession {
        BatchSession::new(cache, resolver).with_usage_warning_threshold(self.usage_warning_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::query::Tier;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GeocoderConfig::default();
        assert_eq!(config.rate_limit(), Duration::from_millis(1100));
        assert_eq!(config.retry_delay(), Duration::from_millis(200));
        assert_eq!(config.ttl(), crate::geocode::cache::DEFAULT_TTL);
        assert_eq!(
            config.amenity_fallbacks,
            vec!["restaurant", "cafe", "bar", "fast_food", "pub"]
        );
        assert!(config.user_agent.starts_with("Lokalkarte/"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GeocoderConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, GeocoderConfig::default());
    }

    #[test]
    fn test_partial_file_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"city_fallback": false, "rate_limit_ms": 2000, "country_code": "de"}}"#).unwrap();

        let config = GeocoderConfig::load(file.path()).unwrap();
        assert!(!config.city_fallback);
        assert_eq!(config.rate_limit(), Duration::from_secs(2));
        assert_eq!(config.country_code, "de");
        assert_eq!(config.cache_ttl_days, 30);

        let queries = config.query_builder().build("6900 Bregenz, Kornmarktstraße 5", None);
        assert!(queries.iter().all(|q| q.tier != Tier::CityLevel));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            GeocoderConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_transport_uses_settings() {
        let config = GeocoderConfig {
            endpoint: "http://localhost:9000/search".into(),
            country_code: String::new(),
            ..GeocoderConfig::default()
        };
        let transport = config.transport();
        let query = &config.query_builder().build("Irgendwo", None)[0];
        assert_eq!(transport.endpoint(), "http://localhost:9000/search");
        assert!(transport.query_pairs(query).iter().all(|(k, _)| *k != "countrycodes"));
    }
}
