use crate::config::GeocoderConfig;
use crate::geocode::{BatchSession, CacheStore, Resolver};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub config: GeocoderConfig,
    pub cache: Arc<CacheStore>,
    pub resolver: Arc<Resolver>,
    /// Held for every request that may reach the upstream geocoder, so only
    /// one lookup stream runs at a time.
    pub upstream: tokio::sync::Mutex<()>,
    /// Cancels running batches when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: GeocoderConfig, cache: Arc<CacheStore>, resolver: Arc<Resolver>) -> Self {
        Self {
            config,
            cache,
            resolver,
            upstream: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn session(&self) -> BatchSession {
        self.config.session(self.cache.clone(), self.resolver.clone())
    }
}
