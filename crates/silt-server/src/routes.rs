use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use silt_core::protocol::{self, PullQuery, PushRequest, ResolveConflictRequest, TimestampResponse};

use crate::auth::{extract_bearer_token, AccessTokenVerifier, AuthenticatedUser};
use crate::error::AppError;
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};
use crate::service::SyncService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub verifier: AccessTokenVerifier,
    pub rate_limiter: EndpointRateLimiter,
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/sync/pull", get(pull))
        .route("/sync/push", post(push))
        .route("/sync/resolve-conflict", post(resolve_conflict))
        .route("/sync/status", get(status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public = Router::new()
        .route("/sync/health", get(health))
        .route("/sync/timestamp", get(timestamp));

    Router::new()
        .nest("/v1", protected.merge(public))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn pull(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<PullQuery>,
) -> Result<Response, AppError> {
    let response = state.service.pull(&user.user_id, &query).await?;

    let mut reply = Json(&response).into_response();
    insert_header(
        &mut reply,
        protocol::headers::SYNC_TIMESTAMP,
        &response.server_timestamp.to_string(),
    );
    insert_header(
        &mut reply,
        protocol::headers::HAS_MORE,
        if response.has_more { "true" } else { "false" },
    );
    Ok(reply)
}

async fn push(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<PushRequest>,
) -> Result<Response, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::SyncPush, &user.user_id)
        .await?;

    let response = state.service.push(&user.user_id, request).await?;

    let mut reply = Json(&response).into_response();
    insert_header(
        &mut reply,
        protocol::headers::SYNC_TIMESTAMP,
        &response.server_timestamp.to_string(),
    );
    insert_header(
        &mut reply,
        protocol::headers::ACCEPTED_COUNT,
        &response.accepted.len().to_string(),
    );
    insert_header(
        &mut reply,
        protocol::headers::REJECTED_COUNT,
        &response.rejected.len().to_string(),
    );
    Ok(reply)
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ResolveConflictRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::ResolveConflict, &user.user_id)
        .await?;

    state.service.resolve_conflict(&user.user_id, request).await?;
    Ok(Json(serde_json::json!({ "resolved": true })))
}

async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<silt_core::protocol::SyncStatusResponse>, AppError> {
    Ok(Json(state.service.status(&user.user_id).await?))
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    rate_limits: RateLimitMetricsSnapshot,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rate_limits: state.rate_limiter.metrics_snapshot(),
    })
}

async fn timestamp() -> Json<TimestampResponse> {
    let now = chrono::Utc::now();
    Json(TimestampResponse {
        timestamp: now.to_rfc3339(),
        unix_timestamp: now.timestamp_millis(),
    })
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}
