//! Geocoding transports: the seam the resolver talks through, and the
//! OpenStreetMap Nominatim implementation behind it.

use super::query::GeocodeQuery;
use super::types::TransportError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const NOMINATIM_SEARCH_URL: &str = "https://nominatim.openstreetmap.org/search";

/// One search hit as returned by the endpoint. Coordinates stay strings
/// until the resolver parses them.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub lat: String,
    pub lon: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl SearchHit {
    /// Parsed `(lat, lon)`, if both are finite numbers.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let lat: f64 = self.lat.trim().parse().ok()?;
        let lon: f64 = self.lon.trim().parse().ok()?;
        (lat.is_finite() && lon.is_finite()).then_some((lat, lon))
    }
}

/// Executes a single geocoding query.
#[async_trait]
pub trait GeocodeTransport: Send + Sync {
    async fn search(&self, query: &GeocodeQuery) -> Result<Vec<SearchHit>, TransportError>;
}

// ─── Nominatim ──────────────────────────────────────────────────

/// HTTP transport against a Nominatim `/search` endpoint.
#[derive(Debug, Clone)]
pub struct NominatimTransport {
    endpoint: String,
    user_agent: String,
    country_code: Option<String>,
    timeout: Duration,
}

impl Default for NominatimTransport {
    fn default() -> Self {
        Self {
            endpoint: NOMINATIM_SEARCH_URL.to_string(),
            user_agent: format!("Lokalkarte/{}", env!("CARGO_PKG_VERSION")),
            country_code: Some("at".to_string()),
            timeout: Duration::from_secs(10),
        }
    }
}

impl NominatimTransport {
    pub fn new(endpoint: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            user_agent: user_agent.into(),
            ..Self::default()
        }
    }

    /// Restrict results to one ISO 3166-1 alpha-2 country. Empty disables it.
    pub fn with_country(mut self, country_code: &str) -> Self {
        let cc = country_code.trim().to_lowercase();
        self.country_code = (!cc.is_empty()).then_some(cc);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Query-string pairs for `query`, in request order. Encoding is left
    /// to the HTTP client.
    pub fn query_pairs(&self, query: &GeocodeQuery) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("format", "json".to_string())];
        pairs.extend(query.params().into_iter().map(|(k, v)| (k, v.to_string())));
        if let Some(cc) = &self.country_code {
            pairs.push(("countrycodes", cc.clone()));
        }
        pairs.push(("limit", "1".to_string()));
        pairs
    }

    fn request(&self, pairs: &[(&'static str, String)]) -> ureq::Request {
        pairs.iter().fold(
            ureq::get(&self.endpoint)
                .set("User-Agent", &self.user_agent)
                .timeout(self.timeout),
            |request, (key, value)| request.query(key, value),
        )
    }

    fn fetch(request: ureq::Request) -> Result<Vec<SearchHit>, TransportError> {
        let response = request.call().map_err(|e| match e {
            ureq::Error::Status(429, _) => TransportError::RateLimited,
            ureq::Error::Status(code, _) => TransportError::Status(code),
            ureq::Error::Transport(t) => TransportError::Network(t.to_string()),
        })?;

        response
            .into_json()
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl GeocodeTransport for NominatimTransport {
    async fn search(&self, query: &GeocodeQuery) -> Result<Vec<SearchHit>, TransportError> {
        let pairs = self.query_pairs(query);
        log::debug!("GET {} {:?}", self.endpoint, pairs);
        let request = self.request(&pairs);

        tokio::task::spawn_blocking(move || Self::fetch(request))
            .await
            .map_err(|e| TransportError::Network(format!("request task failed: {}", e)))?
    }
}
