//! HTTP surface of the read-through cache.
//!
//! - GET  /v1/items/{domain}/{id}
//! - POST /v1/batch/{domain}
//! - POST /v1/invalidate
//! - GET  /v1/cache/stats
//! - GET  /health
//! - GET  /metrics

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::domain::CacheDomain;
use crate::cache::entry::cache_key;
use crate::cache::store::StoreStats;
use crate::config::{Config, DomainConfig};
use crate::error::CacheError;
use crate::invalidation::persisted::{LocalCopyHandle, LocalCopyWorker, LocalStore};
use crate::invalidation::registry::{
    InvalidationContext, InvalidationDomain, InvalidationRegistry, InvalidationReport, Subscription,
};
use crate::metrics::CacheMetrics;
use crate::upstream::{UpstreamClient, UpstreamError};

/// A cache domain together with the upstream routes it reads through.
pub struct ServedDomain {
    pub cache: CacheDomain<Value>,
    pub config: DomainConfig,
}

/// Application state shared across handlers.
pub struct AppState {
    pub domains: BTreeMap<String, ServedDomain>,
    pub registry: InvalidationRegistry,
    pub local_store: Arc<dyn LocalStore>,
    pub local_copies: LocalCopyHandle,
    pub upstream: UpstreamClient,
    pub metrics: CacheMetrics,
    pub start_time: Instant,
    pub request_timeout: Duration,
    _subscriptions: Vec<Subscription>,
}

impl AppState {
    /// Build every configured domain and wire it to the invalidation registry.
    ///
    /// Spawns the worker that writes and purges local copies, so it must be
    /// called from within a Tokio runtime.
    pub fn new(config: &Config, local_store: Arc<dyn LocalStore>) -> anyhow::Result<Self> {
        let metrics = CacheMetrics::new()?;

        let (local_copies, _worker) = LocalCopyWorker::spawn(Arc::clone(&local_store));
        let registry = InvalidationRegistry::builder()
            .metrics(metrics.clone())
            .purger(local_copies.clone(), config.invalidation.purge_domains.iter().cloned())
            .build();

        let mut domains = BTreeMap::new();
        let mut subscriptions = Vec::new();
        for (name, domain_config) in &config.domains {
            let cache = CacheDomain::with_metrics(name.clone(), domain_config.cache.clone(), metrics.clone())?;
            let handle = local_copies.clone();
            cache.on_fill(move |key: &str, value: &Value| {
                if !handle.persist(key, value.clone()) {
                    warn!(key, "Local copy worker stopped; value not persisted");
                }
            });
            for invalidation_domain in &domain_config.invalidated_by {
                subscriptions.push(cache.bind(&registry, invalidation_domain.clone()));
            }
            domains.insert(
                name.clone(),
                ServedDomain {
                    cache,
                    config: domain_config.clone(),
                },
            );
        }

        Ok(Self {
            domains,
            registry,
            local_store,
            local_copies,
            upstream: UpstreamClient::new(&config.upstream)?,
            metrics,
            start_time: Instant::now(),
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            _subscriptions: subscriptions,
        })
    }

    fn domain(&self, name: &str) -> Result<&ServedDomain, ApiError> {
        self.domains
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("unknown cache domain {name:?}")))
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let timeout = state.request_timeout;
    Router::new()
        .route("/v1/items/{domain}/{id}", get(get_item))
        .route("/v1/batch/{domain}", post(get_batch))
        .route("/v1/invalidate", post(invalidate))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)),
        )
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Handler failures mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::BadGateway(m) => (StatusCode::BAD_GATEWAY, m),
            ApiError::GatewayTimeout(m) => (StatusCode::GATEWAY_TIMEOUT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match &err {
            CacheError::Fetch(cause) => match cause.downcast_ref::<UpstreamError>() {
                Some(UpstreamError::NotFound { .. }) => ApiError::NotFound(err.to_string()),
                _ => ApiError::BadGateway(err.to_string()),
            },
            CacheError::Timeout { .. } => ApiError::GatewayTimeout(err.to_string()),
            CacheError::Aborted { .. } => ApiError::BadGateway(err.to_string()),
            CacheError::Config(_) => ApiError::Internal(err.to_string()),
        }
    }
}

fn validate_id(id: &str) -> Result<(), ApiError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid id {id:?}")))
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub domain: InvalidationDomain,
    #[serde(flatten)]
    pub context: InvalidationContext,
}

#[derive(Debug, Serialize)]
pub struct DomainStatsResponse {
    #[serde(flatten)]
    pub stats: StoreStats,
    pub in_flight: usize,
    pub hit_ratio: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub domains: BTreeMap<String, DomainStatsResponse>,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_item(
    State(state): State<Arc<AppState>>,
    Path((domain_name, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    validate_id(&id)?;
    let domain = state.domain(&domain_name)?;
    let key = cache_key(&domain_name, &id);
    let request_id = Uuid::new_v4();

    // Fetched values reach the local store through the domain's fill hook.
    let fetch = {
        let upstream = state.upstream.clone();
        let template = domain.config.item_path.clone();
        let id = id.clone();
        move || async move {
            let value = upstream.fetch_item(&template, &id).await?;
            Ok::<Value, anyhow::Error>(value)
        }
    };

    match domain.cache.get_or_fetch(&key, fetch).await {
        Ok(value) => Ok(Json(value).into_response()),
        Err(err) => {
            let api_error = ApiError::from(err);
            if matches!(api_error, ApiError::NotFound(_)) {
                return Err(api_error);
            }
            // Serve the persisted copy rather than failing outright.
            match state.local_store.get(&key).await {
                Ok(Some(stale)) => {
                    info!(%request_id, key = %key, "Serving persisted copy after fetch failure");
                    let mut response = Json(stale).into_response();
                    response
                        .headers_mut()
                        .insert("x-cache", HeaderValue::from_static("stale"));
                    Ok(response)
                }
                _ => Err(api_error),
            }
        }
    }
}

async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(domain_name): Path<String>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<HashMap<String, Value>>, ApiError> {
    let domain = state.domain(&domain_name)?;
    let batch_path = domain
        .config
        .batch_path
        .clone()
        .ok_or_else(|| ApiError::BadRequest(format!("domain {domain_name:?} has no batch endpoint")))?;
    for id in &req.ids {
        validate_id(id)?;
    }

    let prefix = format!("{domain_name}:");
    let keys: Vec<String> = req.ids.iter().map(|id| cache_key(&domain_name, id)).collect();

    let upstream = state.upstream.clone();
    let fetch_prefix = prefix.clone();
    let found = domain
        .cache
        .get_or_fetch_batch(keys, move |missing| async move {
            let ids: Vec<String> = missing
                .iter()
                .filter_map(|key| key.strip_prefix(&fetch_prefix).map(str::to_string))
                .collect();
            let values = upstream.fetch_batch(&batch_path, &ids).await?;
            Ok::<HashMap<String, Value>, anyhow::Error>(
                values
                    .into_iter()
                    .map(|(id, value)| (format!("{fetch_prefix}{id}"), value))
                    .collect(),
            )
        })
        .await?;

    Ok(Json(
        found
            .into_iter()
            .filter_map(|(key, value)| key.strip_prefix(&prefix).map(|id| (id.to_string(), value)))
            .collect(),
    ))
}

async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvalidateRequest>,
) -> Json<InvalidationReport> {
    Json(state.registry.invalidate(req.domain, &req.context))
}

fn domain_stats(state: &AppState) -> BTreeMap<String, DomainStatsResponse> {
    state
        .domains
        .iter()
        .map(|(name, served)| {
            let stats = served.cache.stats();
            let hit_ratio = stats.hit_ratio();
            (
                name.clone(),
                DomainStatsResponse {
                    stats,
                    in_flight: served.cache.in_flight(),
                    hit_ratio,
                },
            )
        })
        .collect()
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, DomainStatsResponse>> {
    Json(domain_stats(&state))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        domains: domain_stats(&state),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::invalidation::persisted::MemoryLocalStore;

    fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        // Nothing listens here; fetches fail fast.
        config.upstream.base_url = "http://127.0.0.1:9".to_string();
        config.upstream.request_timeout_ms = 500;
        Arc::new(AppState::new(&config, Arc::new(MemoryLocalStore::new())).unwrap())
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_cached_item_served_without_upstream() {
        let state = test_state();
        state.domains["users"]
            .cache
            .set("users:u1", serde_json::json!({"name": "Ada"}));

        let response = build_router(state)
            .oneshot(Request::get("/v1/items/users/u1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["name"], "Ada");
    }

    #[tokio::test]
    async fn test_unknown_domain_is_404() {
        let response = build_router(test_state())
            .oneshot(Request::get("/v1/items/nope/u1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_id_is_400() {
        let response = build_router(test_state())
            .oneshot(Request::get("/v1/items/users/a.b").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upstream_failure_falls_back_to_persisted_copy() {
        let state = test_state();
        state
            .local_store
            .put("users:u2", serde_json::json!({"name": "Grace"}))
            .await
            .unwrap();

        let response = build_router(state)
            .oneshot(Request::get("/v1/items/users/u2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "stale");
    }

    #[tokio::test]
    async fn test_upstream_failure_without_copy_is_502() {
        let response = build_router(test_state())
            .oneshot(Request::get("/v1/items/users/u3").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_invalidate_endpoint_drops_entries() {
        let state = test_state();
        state.domains["users"].cache.set("users:u1", serde_json::json!(1));
        state.domains["users"].cache.set("users:u2", serde_json::json!(2));

        let response = build_router(Arc::clone(&state))
            .oneshot(
                Request::post("/v1/invalidate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"domain":"userProfile","user_id":"u1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["notified"], 1);
        assert!(state.domains["users"].cache.get("users:u1").is_none());
        assert!(state.domains["users"].cache.get("users:u2").is_some());
    }

    #[tokio::test]
    async fn test_batch_all_cached() {
        let state = test_state();
        state.domains["users"].cache.set("users:u1", serde_json::json!(1));
        state.domains["users"].cache.set("users:u2", serde_json::json!(2));

        let response = build_router(state)
            .oneshot(
                Request::post("/v1/batch/users")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"ids":["u1","u2"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["u1"], 1);
        assert_eq!(body["u2"], 2);
    }

    #[tokio::test]
    async fn test_item_named_batch_is_readable() {
        let state = test_state();
        state.domains["users"].cache.set("users:batch", serde_json::json!("b"));

        let response = build_router(state)
            .oneshot(Request::get("/v1/items/users/batch").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, "b");
    }

    #[tokio::test]
    async fn test_fetched_value_is_persisted() {
        let state = test_state();
        state.domains["pages"]
            .cache
            .get_or_fetch("pages:p1", || async { Ok::<_, anyhow::Error>(serde_json::json!("v1")) })
            .await
            .unwrap();

        state.local_copies.flush().await;
        assert_eq!(
            state.local_store.get("pages:p1").await.unwrap(),
            Some(serde_json::json!("v1"))
        );
    }

    #[tokio::test]
    async fn test_fetch_invalidated_midway_leaves_no_local_copy() {
        let state = test_state();
        state
            .local_store
            .put("pages:u1", serde_json::json!("older"))
            .await
            .unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state.domains["pages"]
                    .cache
                    .get_or_fetch("pages:u1", || async move {
                        let _ = release_rx.await;
                        Ok::<_, anyhow::Error>(serde_json::json!("pre-mutation"))
                    })
                    .await
            })
        };
        while state.domains["pages"].cache.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let report = state
            .registry
            .invalidate(InvalidationDomain::UserPages, &InvalidationContext::for_user("u1"));
        assert!(report.purge_scheduled);
        state.local_copies.flush().await;
        release_tx.send(()).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), serde_json::json!("pre-mutation"));
        state.local_copies.flush().await;
        assert_eq!(state.local_store.get("pages:u1").await.unwrap(), None);
        assert!(state.domains["pages"].cache.get("pages:u1").is_none());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = test_state();
        state.domains["users"].cache.get("users:missing");

        let response = build_router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("wewrite_cache_lookups_total"));
    }
}
