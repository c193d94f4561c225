//! Batch orchestration: cache first, resolver for misses, progress as we go.
//!
//! Uncached items are resolved strictly one after another with the
//! rate-limit interval between them (none after the last). The output keeps
//! the input order.

use super::cache::{CacheSnapshot, CacheStore};
use super::resolver::{Resolution, Resolver};
use super::types::{GeocodeError, GeocodeNotice, NoticeSink, ResolvedItem, RestaurantItem};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Uncached addresses at which a run deserves an explicit go-ahead.
pub const DEFAULT_USAGE_WARNING_THRESHOLD: usize = 100;

/// A progress report: `processed` of `total` items handled, with all
/// results produced so far (cached ones first, then in resolution order).
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress<'a> {
    pub processed: usize,
    pub total: usize,
    pub results: &'a [ResolvedItem],
}

impl BatchProgress<'_> {
    /// Results with coordinates.
    pub fn located(&self) -> usize {
        self.results.iter().filter(|r| r.coords.is_some()).count()
    }
}

/// What a run would cost before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPlan {
    pub total: usize,
    pub cached: usize,
    pub uncached: usize,
    #[serde(serialize_with = "as_secs")]
    pub estimated: Duration,
    pub exceeds_usage_threshold: bool,
    pub cache_readable: bool,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Cancel `token` once `signal` completes. A signal listener that fails to
/// install leaves the token alone. Returns whether the token was cancelled.
pub async fn cancel_on<F>(token: CancellationToken, signal: F) -> bool
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            token.cancel();
            true
        }
        Err(e) => {
            log::warn!("Cannot listen for interrupts, cancellation disabled: {}", e);
            false
        }
    }
}

/// One caller-owned geocoding session.
///
/// Cancelling the session stops a running batch before its next request or
/// during any pause; a request already in flight runs to completion.
/// A cancelled session stays cancelled.
pub struct BatchSession {
    cache: Arc<CacheStore>,
    resolver: Arc<Resolver>,
    cancel: CancellationToken,
    notices: Option<NoticeSink>,
    usage_warning_threshold: usize,
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl BatchSession {
    pub fn new(cache: Arc<CacheStore>, resolver: Arc<Resolver>) -> Self {
        Self {
            cache,
            resolver,
            cancel: CancellationToken::new(),
            notices: None,
            usage_warning_threshold: DEFAULT_USAGE_WARNING_THRESHOLD,
            processed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_notices(mut self, sink: NoticeSink) -> Self {
        self.notices = Some(sink);
        self
    }

    pub fn with_usage_warning_threshold(mut self, threshold: usize) -> Self {
        self.usage_warning_threshold = threshold;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Pause between two uncached items.
    pub fn rate_limit(&self) -> Duration {
        self.resolver.rate_limit()
    }

    /// `(processed, total)` of the current or last run.
    pub fn progress(&self) -> (usize, usize) {
        (
            self.processed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    fn set_progress(&self, processed: usize, total: usize) {
        self.processed.store(processed, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    fn notify(&self, notice: GeocodeNotice) {
        if let Some(sink) = &self.notices {
            sink(&notice);
        }
    }

    async fn load_snapshot(&self) -> CacheSnapshot {
        match self.cache.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Geocode cache unreadable, resolving everything: {}", e);
                CacheSnapshot::default()
            }
        }
    }

    /// Cost estimate for resolving `items`. An unreadable cache counts every
    /// item as uncached, as the run itself would.
    pub async fn plan(&self, items: &[RestaurantItem]) -> BatchPlan {
        let (snapshot, cache_readable) = match self.cache.load().await {
            Ok(snapshot) => (snapshot, true),
            Err(e) => {
                log::warn!("Geocode cache unreadable, planning without it: {}", e);
                (CacheSnapshot::default(), false)
            }
        };
        let cached = items.iter().filter(|i| snapshot.contains(&i.address)).count();
        let uncached = items.len() - cached;
        let per_item_ms = u64::try_from(self.rate_limit().as_millis()).unwrap_or(u64::MAX);
        BatchPlan {
            total: items.len(),
            cached,
            uncached,
            estimated: Duration::from_millis(per_item_ms.saturating_mul(uncached as u64)),
            exceeds_usage_threshold: uncached >= self.usage_warning_threshold,
            cache_readable,
        }
    }

    /// Resolve one listing, consulting and updating the cache.
    pub async fn resolve_item(&self, item: RestaurantItem) -> ResolvedItem {
        match self.cache.get(&item.address).await {
            Ok(Some(entry)) => {
                return ResolvedItem {
                    item,
                    coords: Some(entry.coords),
                    from_cache: true,
                    index: 0,
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Geocode cache unreadable: {}", e),
        }

        let coords = self.lookup(&item).await.coords;
        if let Some(coords) = coords {
            if let Err(e) = self.cache.save(&item.address, coords).await {
                log::warn!("Could not cache '{}': {}", item.address, e);
            }
        }
        ResolvedItem {
            item,
            coords,
            from_cache: false,
            index: 0,
        }
    }

    async fn lookup(&self, item: &RestaurantItem) -> Resolution {
        self.resolver
            .resolve_cancellable(&item.address, item.name.as_deref(), &self.cancel, self.notices.as_ref())
            .await
    }

    /// Resolve every item without progress reporting.
    pub async fn resolve_all(&self, items: Vec<RestaurantItem>) -> Result<Vec<ResolvedItem>, GeocodeError> {
        self.resolve_all_with_progress(items, |_| {}).await
    }

    /// Resolve every item. `on_progress` fires once for the cached items
    /// (if any) and twice per uncached item, before and after its lookup.
    pub async fn resolve_all_with_progress<F>(
        &self,
        items: Vec<RestaurantItem>,
        mut on_progress: F,
    ) -> Result<Vec<ResolvedItem>, GeocodeError>
    where
        F: FnMut(BatchProgress<'_>),
    {
        let total = items.len();
        self.set_progress(0, total);

        if let Err(e) = self.cache.clean_expired().await {
            log::error!("Geocode cache cleanup failed: {}", e);
        }
        let snapshot = self.load_snapshot().await;

        let mut results: Vec<ResolvedItem> = Vec::with_capacity(total);
        let mut pending = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            match snapshot.get(&item.address) {
                Some(entry) => results.push(ResolvedItem {
                    coords: Some(entry.coords),
                    item,
                    from_cache: true,
                    index,
                }),
                None => pending.push((index, item)),
            }
        }
        drop(snapshot);

        let cached = results.len();
        log::info!(
            "Geocoding {} items: {} cached, {} to resolve",
            total,
            cached,
            pending.len()
        );
        self.set_progress(cached, total);
        if cached > 0 {
            on_progress(BatchProgress { processed: cached, total, results: &results });
        }

        let remaining = pending.len();
        for (i, (index, item)) in pending.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("Geocoding cancelled after {} of {} items", results.len(), total);
                return Err(GeocodeError::Cancelled);
            }
            let processed = cached + i + 1;
            on_progress(BatchProgress { processed, total, results: &results });

            let resolution = self.lookup(&item).await;
            if resolution.cancelled {
                log::info!("Geocoding cancelled after {} of {} items", results.len(), total);
                return Err(GeocodeError::Cancelled);
            }
            let coords = resolution.coords;
            if let Some(coords) = coords {
                if let Err(e) = self.cache.save(&item.address, coords).await {
                    log::warn!("Could not cache '{}': {}", item.address, e);
                }
            }
            results.push(ResolvedItem {
                item,
                coords,
                from_cache: false,
                index,
            });
            self.set_progress(processed, total);
            on_progress(BatchProgress { processed, total, results: &results });

            if i + 1 < remaining {
                self.pause().await?;
            }
        }

        let failed = results.iter().filter(|r| r.coords.is_none()).count();
        if failed > 0 {
            log::warn!("{} of {} addresses could not be located", failed, total);
            if failed == total {
                self.notify(GeocodeNotice::CompleteFailure { total });
            } else {
                self.notify(GeocodeNotice::PartialFailure { failed, total });
            }
        }

        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    async fn pause(&self) -> Result<(), GeocodeError> {
        if self.cancel.is_cancelled() {
            return Err(GeocodeError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                log::info!("Geocoding cancelled during rate-limit pause");
                Err(GeocodeError::Cancelled)
            }
            _ = tokio::time::sleep(self.rate_limit()) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::cache::CACHE_KEY;
    use crate::geocode::query::QueryKind;
    use crate::geocode::resolver::DEFAULT_RATE_LIMIT;
    use crate::geocode::store::{KeyValueStore, MemoryStore};
    use crate::geocode::testing::{assert_gap, hit, FakeTransport};
    use crate::geocode::types::{Coordinates, StoreError, TransportError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    struct Fixture {
        session: BatchSession,
        cache: Arc<CacheStore>,
        transport: Arc<FakeTransport>,
        notices: Arc<Mutex<Vec<GeocodeNotice>>>,
    }

    fn fixture_with(transport: FakeTransport, store: Arc<dyn KeyValueStore>) -> Fixture {
        let transport = Arc::new(transport);
        let cache = Arc::new(CacheStore::new(store));
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        let session = BatchSession::new(cache.clone(), Arc::new(Resolver::new(transport.clone())))
            .with_notices(Arc::new(move |n: &GeocodeNotice| sink.lock().unwrap().push(n.clone())));
        Fixture { session, cache, transport, notices }
    }

    fn fixture(transport: FakeTransport) -> Fixture {
        fixture_with(transport, Arc::new(MemoryStore::new()))
    }

    /// Finds every address on its first attempt.
    fn always_hit() -> FakeTransport {
        FakeTransport::new(|_, _| Ok(hit("48.2", "16.3")))
    }

    fn address_of(query: &QueryKind) -> String {
        match query {
            QueryKind::Structured(s) => format!("{} {}", s.postalcode, s.city),
            QueryKind::FreeForm(q) => q.clone(),
        }
    }

    fn item(address: &str) -> RestaurantItem {
        RestaurantItem::new(address)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_item_amenity_tier() {
        let f = fixture(FakeTransport::scripted(vec![Ok(hit("48.1975", "16.3658"))]));
        let items = vec![item("1040 Wien, Rechte Wienzeile 1").with_name("Naschmarkt Deli")];

        let results = f.session.resolve_all(items).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].coords, Some(Coordinates::precise(48.1975, 16.3658)));
        assert!(!results[0].from_cache);
        assert_eq!(f.transport.call_count(), 1);
        assert!(f.notices.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_preserved_around_cached_item() {
        let f = fixture(always_hit());
        f.cache.save("2020 Hollabrunn, Hauptplatz 2", Coordinates::precise(1.0, 2.0)).await.unwrap();
        let items = vec![
            item("1010 Wien, Stephansplatz 1").with_id("a"),
            item("2020 Hollabrunn, Hauptplatz 2").with_id("b"),
            item("3100 St. Pölten, Rathausplatz 3").with_id("c"),
        ];

        let results = f.session.resolve_all(items).await.unwrap();

        let ids: Vec<_> = results.iter().map(|r| r.item.id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let from_cache: Vec<_> = results.iter().map(|r| r.from_cache).collect();
        assert_eq!(from_cache, vec![false, true, false]);
        assert_eq!(results[1].coords, Some(Coordinates::precise(1.0, 2.0)));
        let indices: Vec<_> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let looked_up: Vec<_> = f.transport.calls().iter().map(|q| address_of(&q.kind)).collect();
        assert_eq!(looked_up, vec!["1010 Wien", "3100 St. Pölten"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_through_then_cache_hit() {
        let f = fixture(always_hit());
        let items = vec![item("5020 Salzburg, Getreidegasse 9").with_name("Stiftskeller")];

        let first = f.session.resolve_all(items.clone()).await.unwrap();
        assert!(!first[0].from_cache);
        assert_eq!(f.transport.call_count(), 1);

        let second = f.session
            .resolve_all(vec![item("  5020 SALZBURG, Getreidegasse 9 ")])
            .await
            .unwrap();
        assert!(second[0].from_cache);
        assert_eq!(second[0].coords, first[0].coords);
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_items_without_trailing_wait() {
        let f = fixture(always_hit());
        let items = vec![
            item("1010 Wien, A 1"),
            item("1020 Wien, B 2"),
            item("1030 Wien, C 3"),
        ];

        let start = tokio::time::Instant::now();
        f.session.resolve_all(items).await.unwrap();
        let elapsed = start.elapsed();

        let times = f.transport.call_times();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert_gap(pair[1] - pair[0], DEFAULT_RATE_LIMIT);
        }
        assert_gap(elapsed, DEFAULT_RATE_LIMIT * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_sequence() {
        let f = fixture(always_hit());
        f.cache.save("1010 Wien, Cached Street 1", Coordinates::precise(48.5, 16.5)).await.unwrap();
        let items = vec![
            item("1020 Wien, New Street 2"),
            item("1010 Wien, Cached Street 1"),
            item("1030 Wien, Other Street 3"),
        ];

        let mut events = Vec::new();
        f.session
            .resolve_all_with_progress(items, |p| events.push((p.processed, p.total, p.results.len(), p.located())))
            .await
            .unwrap();

        assert_eq!(
            events,
            vec![(1, 3, 1, 1), (2, 3, 1, 1), (2, 3, 2, 2), (3, 3, 2, 2), (3, 3, 3, 3)]
        );
        assert_eq!(f.session.progress(), (3, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cached_prefix_event_when_nothing_cached() {
        let f = fixture(always_hit());
        let mut events = Vec::new();
        f.session
            .resolve_all_with_progress(vec![item("1010 Wien, A 1")], |p| events.push(p.processed))
            .await
            .unwrap();
        assert_eq!(events, vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fail_reports_complete_failure() {
        let f = fixture(FakeTransport::empty());
        let results = f.session
            .resolve_all(vec![item("1040 Wien, Rechte Wienzeile 1").with_name("Naschmarkt Deli")])
            .await
            .unwrap();

        assert_eq!(results[0].coords, None);
        assert_eq!(
            f.notices.lock().unwrap().as_slice(),
            &[GeocodeNotice::CompleteFailure { total: 1 }]
        );
        assert!(f.cache.load().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_count() {
        let f = fixture(FakeTransport::new(|q, _| {
            Ok(if address_of(&q.kind).starts_with("1010") { hit("48.2", "16.3") } else { vec![] })
        }));
        let results = f.session
            .resolve_all(vec![item("1010 Wien, A 1"), item("Nowhere Street")])
            .await
            .unwrap();

        assert!(results[0].coords.is_some());
        assert!(results[1].coords.is_none());
        assert_eq!(
            f.notices.lock().unwrap().as_slice(),
            &[GeocodeNotice::PartialFailure { failed: 1, total: 2 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch() {
        let f = fixture(FakeTransport::empty());
        let results = f.session.resolve_all(Vec::new()).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(f.transport.call_count(), 0);
        assert!(f.notices.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_progress_callback() {
        let f = fixture(always_hit());
        let token = f.session.cancellation_token();
        let items = vec![item("1010 Wien, A 1"), item("1020 Wien, B 2"), item("1030 Wien, C 3")];

        let result = f.session
            .resolve_all_with_progress(items, |p| {
                if p.results.len() == 1 {
                    token.cancel();
                }
            })
            .await;

        assert!(matches!(result, Err(GeocodeError::Cancelled)));
        assert_eq!(f.transport.call_count(), 1);
        // The finished lookup was still written through.
        assert_eq!(f.cache.load().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_rate_limit_pause() {
        let f = fixture(always_hit());
        let token = f.session.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = f.session
            .resolve_all(vec![item("1010 Wien, A 1"), item("1020 Wien, B 2")])
            .await;

        assert!(matches!(result, Err(GeocodeError::Cancelled)));
        assert_eq!(f.transport.call_count(), 1);
        assert!(start.elapsed() < DEFAULT_RATE_LIMIT);
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<Value>, StoreError> {
            Err(std::io::Error::other("disk gone").into())
        }
        async fn set(&self, _: &str, _: Value) -> Result<(), StoreError> {
            Err(std::io::Error::other("disk gone").into())
        }
        async fn remove(&self, _: &str) -> Result<(), StoreError> {
            Err(std::io::Error::other("disk gone").into())
        }
        async fn bytes_in_use(&self, _: &str) -> Result<u64, StoreError> {
            Err(std::io::Error::other("disk gone").into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failures_do_not_abort_batch() {
        let f = fixture_with(always_hit(), Arc::new(BrokenStore));
        let results = f.session
            .resolve_all(vec![item("1010 Wien, A 1"), item("1020 Wien, B 2")])
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.coords.is_some() && !r.from_cache));

        let single = f.session.resolve_item(item("1030 Wien, C 3")).await;
        assert!(single.coords.is_some());

        let plan = f.session.plan(&[item("1040 Wien, D 4"), item("1050 Wien, E 5")]).await;
        assert!(!plan.cache_readable);
        assert_eq!(plan.uncached, 2);
        assert_eq!(plan.estimated, DEFAULT_RATE_LIMIT * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_item_uses_cache() {
        let f = fixture(always_hit());
        let first = f.session.resolve_item(item("1010 Wien, A 1").with_name("Figlmüller")).await;
        assert!(!first.from_cache);
        let second = f.session.resolve_item(item("1010 wien, a 1")).await;
        assert!(second.from_cache);
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_plan() {
        let store = Arc::new(MemoryStore::new());
        let f = fixture_with(FakeTransport::empty(), store.clone());
        f.cache.save("1010 Wien, A 1", Coordinates::precise(48.2, 16.3)).await.unwrap();
        let session = f.session.with_usage_warning_threshold(2);

        let plan = session
            .plan(&[item("1010 Wien, A 1"), item("1020 Wien, B 2"), item("1030 Wien, C 3")])
            .await;
        assert!(plan.cache_readable);
        assert_eq!(plan.total, 3);
        assert_eq!(plan.cached, 1);
        assert_eq!(plan.uncached, 2);
        assert_eq!(plan.estimated, DEFAULT_RATE_LIMIT * 2);
        assert!(plan.exceeds_usage_threshold);

        assert!(store.get(CACHE_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_plan_estimate_saturates() {
        let transport = Arc::new(FakeTransport::empty());
        let resolver = Resolver::new(transport).with_delays(Duration::from_millis(200), Duration::MAX);
        let cache = Arc::new(CacheStore::new(Arc::new(MemoryStore::new())));
        let session = BatchSession::new(cache, Arc::new(resolver));

        let plan = session.plan(&[item("1010 Wien, A 1"), item("1020 Wien, B 2")]).await;
        assert_eq!(plan.uncached, 2);
        assert_eq!(plan.estimated, Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_rate_limited() {
        let f = fixture(FakeTransport::new(|_, _| Err(TransportError::RateLimited)));
        let token = f.session.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = f.session
            .resolve_all(vec![
                item("1040 Wien, Rechte Wienzeile 1").with_name("Naschmarkt Deli"),
                item("1010 Wien, Stephansplatz 3"),
            ])
            .await;

        assert!(matches!(result, Err(GeocodeError::Cancelled)));
        assert_eq!(f.transport.call_count(), 1);
        assert!(start.elapsed() < DEFAULT_RATE_LIMIT);
        assert!(f.notices.lock().unwrap().iter().all(|n| matches!(n, GeocodeNotice::RateLimited { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_notice_reaches_session_sink() {
        let f = fixture(FakeTransport::scripted(vec![
            Err(TransportError::RateLimited),
            Ok(hit("48.2", "16.3")),
        ]));
        let results = f.session.resolve_all(vec![item("1010 Wien, Test 2")]).await.unwrap();

        assert!(results[0].coords.is_some());
        assert_eq!(
            f.notices.lock().unwrap().as_slice(),
            &[GeocodeNotice::RateLimited { wait: DEFAULT_RATE_LIMIT }]
        );
    }

    #[tokio::test]
    async fn test_cancel_on_signal() {
        let token = CancellationToken::new();
        assert!(cancel_on(token.clone(), async { Ok(()) }).await);
        assert!(token.is_cancelled());

        let token = CancellationToken::new();
        let failed = async { Err(std::io::Error::other("no signal handler")) };
        assert!(!cancel_on(token.clone(), failed).await);
        assert!(!token.is_cancelled());
    }
}
