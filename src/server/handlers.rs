use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::geocode::{
    BatchPlan, CacheStats, CleanupReport, GeocodeError, GeocodeNotice, ResolvedItem, RestaurantItem,
    StoreError,
};

use super::state::AppState;

// ─── Error response ──────────────────────────────────────────────

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    code: u16,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.1,
            code: self.0.as_u16(),
        };
        (self.0, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        log::error!("Cache storage failure: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Cache storage failure: {}", e))
    }
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    ApiError(status, msg.into())
}

fn millis(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

// ─── POST /api/geocode ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct GeocodeRequest {
    pub items: Vec<RestaurantItem>,
    /// Go ahead even when the run reaches the usage warning threshold.
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Serialize)]
struct NoticeBody {
    #[serde(flatten)]
    notice: GeocodeNotice,
    message: String,
}

impl From<GeocodeNotice> for NoticeBody {
    fn from(notice: GeocodeNotice) -> Self {
        Self {
            message: notice.to_string(),
            notice,
        }
    }
}

#[derive(Serialize)]
pub struct GeocodeResponse {
    results: Vec<ResolvedItem>,
    total: usize,
    located: usize,
    notices: Vec<NoticeBody>,
}

#[derive(Serialize)]
struct ConfirmationRequired {
    error: String,
    code: u16,
    plan: BatchPlan,
}

pub async fn geocode_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GeocodeRequest>,
) -> Result<Json<GeocodeResponse>, Response> {
    let start = Instant::now();
    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    let session = state
        .session()
        .with_cancellation(state.shutdown.child_token())
        .with_notices(Arc::new(move |n: &GeocodeNotice| {
            if let Ok(mut list) = sink.lock() {
                list.push(n.clone());
            }
        }));

    if !request.confirm {
        let plan = session.plan(&request.items).await;
        if plan.exceeds_usage_threshold {
            let body = ConfirmationRequired {
                error: format!(
                    "{} uncached addresses (about {} s of lookups); resend with \"confirm\": true",
                    plan.uncached,
                    plan.estimated.as_secs()
                ),
                code: StatusCode::CONFLICT.as_u16(),
                plan,
            };
            return Err((StatusCode::CONFLICT, Json(body)).into_response());
        }
    }

    let total = request.items.len();
    let results = {
        let _upstream = state.upstream.lock().await;
        session
            .resolve_all_with_progress(request.items, |p| {
                log::debug!("Batch progress {}/{}", p.processed, p.total);
            })
            .await
    };
    let results = match results {
        Ok(results) => results,
        Err(GeocodeError::Cancelled) => {
            return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "Geocoding cancelled: server shutting down")
                .into_response())
        }
    };

    let located = results.iter().filter(|r| r.coords.is_some()).count();
    let notices: Vec<NoticeBody> = notices
        .lock()
        .map(|list| list.iter().cloned().map(NoticeBody::from).collect())
        .unwrap_or_default();
    log::info!(
        "POST /api/geocode items={} -> {} located ({:.1}ms)",
        total,
        located,
        millis(start)
    );

    Ok(Json(GeocodeResponse {
        results,
        total,
        located,
        notices,
    }))
}

// ─── GET /api/geocode/single ─────────────────────────────────────

#[derive(Deserialize)]
pub struct SingleQuery {
    pub address: Option<String>,
    pub name: Option<String>,
}

pub async fn geocode_single(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SingleQuery>,
) -> Result<Json<ResolvedItem>, ApiError> {
    let start = Instant::now();
    let address = params.address.as_deref().unwrap_or("").trim();
    if address.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing 'address' parameter"));
    }

    let mut item = RestaurantItem::new(address);
    item.name = params.name.filter(|n| !n.trim().is_empty());

    let resolved = {
        let _upstream = state.upstream.lock().await;
        state.session().resolve_item(item).await
    };

    log::info!(
        "GET /api/geocode/single address={} -> {} ({:.1}ms)",
        address,
        match (&resolved.coords, resolved.from_cache) {
            (Some(c), true) => format!("{} CACHED", c),
            (Some(c), false) => c.to_string(),
            (None, _) => "not found".to_string(),
        },
        millis(start)
    );
    Ok(Json(resolved))
}

// ─── Cache maintenance ───────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    stats: CacheStats,
    size_kb: f64,
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.cache.stats().await?;
    Ok(Json(StatsResponse {
        size_kb: (stats.size_kb() * 100.0).round() / 100.0,
        stats,
    }))
}

pub async fn cache_clear(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state.cache.clear().await?;
    log::info!("DELETE /api/cache -> cleared");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cache_clean(State(state): State<Arc<AppState>>) -> Result<Json<CleanupReport>, ApiError> {
    let report = state.cache.clean_expired().await?;
    log::info!(
        "POST /api/cache/clean -> removed {}, kept {}",
        report.removed,
        report.remaining
    );
    Ok(Json(report))
}
