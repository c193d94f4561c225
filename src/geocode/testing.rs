//! Test doubles shared by the resolver and batch tests.

use super::providers::{GeocodeTransport, SearchHit};
use super::query::GeocodeQuery;
use super::types::TransportError;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

type Responder = dyn Fn(&GeocodeQuery, usize) -> Result<Vec<SearchHit>, TransportError> + Send + Sync;

/// A transport answering from a closure and recording every request.
pub struct FakeTransport {
    respond: Box<Responder>,
    calls: Mutex<Vec<(GeocodeQuery, Instant)>>,
}

impl FakeTransport {
    /// `respond` gets the query and its zero-based call number.
    pub fn new(
        respond: impl Fn(&GeocodeQuery, usize) -> Result<Vec<SearchHit>, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers with `responses` in order, then with empty result sets.
    pub fn scripted(responses: Vec<Result<Vec<SearchHit>, TransportError>>) -> Self {
        Self::new(move |_, n| responses.get(n).cloned().unwrap_or_else(|| Ok(vec![])))
    }

    /// Never finds anything.
    pub fn empty() -> Self {
        Self::new(|_, _| Ok(vec![]))
    }

    pub fn calls(&self) -> Vec<GeocodeQuery> {
        self.calls.lock().unwrap().iter().map(|(q, _)| q.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl GeocodeTransport for FakeTransport {
    async fn search(&self, query: &GeocodeQuery) -> Result<Vec<SearchHit>, TransportError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((query.clone(), Instant::now()));
            calls.len() - 1
        };
        (self.respond)(query, n)
    }
}

pub fn hit(lat: &str, lon: &str) -> Vec<SearchHit> {
    vec![SearchHit {
        lat: lat.to_string(),
        lon: lon.to_string(),
        display_name: None,
    }]
}

/// Paused-clock timers fire on millisecond ticks, so allow a little slack.
pub fn assert_gap(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(5),
        "gap {:?}, expected {:?}",
        actual,
        expected
    );
}
