//! Address resolver: walks the query cascade against a transport.
//!
//! Flow: QueryBuilder → tier 1 … tier N, first tier with a hit wins.
//! A 429 pauses for the rate-limit interval and moves on to the next tier;
//! any other failure is a miss for that tier only. The resolver never
//! touches the cache.

use super::providers::GeocodeTransport;
use super::query::{QueryBuilder, Tier};
use super::types::{Coordinates, GeocodeNotice, NoticeSink, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause between two tiers of the same address.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Minimum spacing between requests demanded by the upstream usage policy.
pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(1100);

/// Outcome of one address lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub coords: Option<Coordinates>,
    /// Tier that produced `coords`.
    pub tier: Option<Tier>,
    /// Requests issued.
    pub attempts: usize,
    /// Requests answered with 429.
    pub rate_limited: usize,
    /// The lookup stopped early on cancellation.
    pub cancelled: bool,
}

/// The resolver with its fallback cascade.
pub struct Resolver {
    transport: Arc<dyn GeocodeTransport>,
    queries: QueryBuilder,
    retry_delay: Duration,
    rate_limit: Duration,
    notices: Option<NoticeSink>,
}

impl Resolver {
    pub fn new(transport: Arc<dyn GeocodeTransport>) -> Self {
        Self {
            transport,
            queries: QueryBuilder::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            rate_limit: DEFAULT_RATE_LIMIT,
            notices: None,
        }
    }

    pub fn with_queries(mut self, queries: QueryBuilder) -> Self {
        self.queries = queries;
        self
    }

    pub fn with_delays(mut self, retry_delay: Duration, rate_limit: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_notices(mut self, sink: NoticeSink) -> Self {
        self.notices = Some(sink);
        self
    }

    pub fn rate_limit(&self) -> Duration {
        self.rate_limit
    }

    /// Coordinates for `address`, or `None` once every tier missed.
    pub async fn resolve(&self, address: &str, poi_name: Option<&str>) -> Option<Coordinates> {
        self.resolve_detailed(address, poi_name).await.coords
    }

    pub async fn resolve_detailed(&self, address: &str, poi_name: Option<&str>) -> Resolution {
        self.resolve_cancellable(address, poi_name, &CancellationToken::new(), None)
            .await
    }

    /// Like [`Resolver::resolve_detailed`], but stops before the next tier and
    /// during any pause once `cancel` fires. `notices` replaces the resolver's
    /// own sink for this lookup.
    pub async fn resolve_cancellable(
        &self,
        address: &str,
        poi_name: Option<&str>,
        cancel: &CancellationToken,
        notices: Option<&NoticeSink>,
    ) -> Resolution {
        let queries = self.queries.build(address, poi_name);
        let notices = notices.or(self.notices.as_ref());
        let mut resolution = Resolution {
            coords: None,
            tier: None,
            attempts: 0,
            rate_limited: 0,
            cancelled: false,
        };
        log::debug!("Geocoding '{}' with {} tiers", address, queries.len());

        for (i, query) in queries.iter().enumerate() {
            if cancel.is_cancelled() {
                log::debug!("Lookup of '{}' cancelled before {} tier", address, query.tier);
                resolution.cancelled = true;
                return resolution;
            }
            resolution.attempts += 1;
            let delay = match self.transport.search(query).await {
                Ok(hits) => match hits.first().map(|h| (h, h.coordinates())) {
                    Some((_, Some((lat, lng)))) => {
                        let coords = Coordinates {
                            lat,
                            lng,
                            approximate: query.is_approximate(),
                        };
                        log::debug!("Found {} for '{}' via {} tier", coords, address, query.tier);
                        resolution.coords = Some(coords);
                        resolution.tier = Some(query.tier.clone());
                        return resolution;
                    }
                    Some((hit, None)) => {
                        log::warn!(
                            "Unparseable coordinates ({:?}, {:?}) for '{}' via {} tier",
                            hit.lat,
                            hit.lon,
                            address,
                            query.tier
                        );
                        self.retry_delay
                    }
                    None => {
                        log::trace!("No match for '{}' via {} tier", address, query.tier);
                        self.retry_delay
                    }
                },
                Err(TransportError::RateLimited) => {
                    resolution.rate_limited += 1;
                    log::warn!(
                        "Rate limited on {} tier for '{}', pausing {:?}",
                        query.tier,
                        address,
                        self.rate_limit
                    );
                    if let Some(sink) = notices {
                        sink(&GeocodeNotice::RateLimited { wait: self.rate_limit });
                    }
                    // The pause replaces the retry delay, even after the last tier.
                    if !sleep_or_cancel(self.rate_limit, cancel).await {
                        resolution.cancelled = true;
                        return resolution;
                    }
                    continue;
                }
                Err(e) => {
                    log::warn!("{} tier failed for '{}': {}", query.tier, address, e);
                    self.retry_delay
                }
            };

            if i + 1 < queries.len() && !sleep_or_cancel(delay, cancel).await {
                resolution.cancelled = true;
                return resolution;
            }
        }

        log::info!("No results for any tier of '{}'", address);
        resolution
    }
}

/// Sleep for `duration` unless `cancel` fires first. False when cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
