use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    entitlement::{
        AuthorizedDecision, DenyReason, EntitlementError, EntitlementService, MeteredAction,
    },
    identity::ActorIdentity,
    ledger::{EventType, UsageMetadata},
    progress::{
        ProgressError, ProgressPayload, ProgressRecord, ProgressStage, ProgressTracker,
        ProgressUpdate, UpsertOutcome, ttl_from_seconds,
    },
    webhook::{
        IngestError, IngestOutcome, SIGNATURE_HEADER, StateChangeIngest, TIMESTAMP_HEADER,
        WebhookDelivery,
    },
};

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    entitlements: EntitlementService,
    ingest: StateChangeIngest,
    progress: ProgressTracker,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        entitlements: EntitlementService,
        ingest: StateChangeIngest,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            config: Arc::new(config),
            entitlements,
            ingest,
            progress,
            started_at: Utc::now(),
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    store_driver: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    ledger_ready: bool,
    progress_ready: bool,
}

#[derive(Debug, Deserialize)]
struct CheckBody {
    identity: ActorIdentity,
    event_type: String,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    resource_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    actor_id: String,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    tier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressBody {
    stage: ProgressStage,
    sequence: u64,
    #[serde(default)]
    payload: ProgressPayload,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    #[serde(flatten)]
    record: ProgressRecord,
    ttl_remaining_seconds: i64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/internal/v1/entitlements/check", post(check_entitlement))
        .route("/internal/v1/entitlements/usage", get(get_usage))
        .route("/webhooks/:provider", post(ingest_webhook))
        .route("/api/progress/:task_id", get(get_progress))
        .route(
            "/internal/v1/progress/:task_id",
            put(put_progress).delete(delete_progress),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        build_sha: state.config.build_sha.clone(),
        uptime_seconds,
        store_driver: state.entitlements.ledger_driver(),
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let ledger_ready = state.entitlements.ready().await;
    let progress_ready = state.progress.ping().await.is_ok();
    let ready = ledger_ready && progress_ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" },
            ledger_ready,
            progress_ready,
        }),
    )
}

async fn check_entitlement(
    State(state): State<AppState>,
    Json(body): Json<CheckBody>,
) -> Result<Json<AuthorizedDecision>, ApiError> {
    let metadata = UsageMetadata::from_parts(&body.event_type, body.metadata)
        .map_err(|error| ApiError::InvalidRequest(error.to_string()))?;
    let decision = state
        .entitlements
        .authorize(
            &body.identity,
            MeteredAction {
                metadata,
                resource_id: body.resource_id,
            },
            Utc::now(),
        )
        .await
        .map_err(ApiError::from_entitlement)?;

    match decision.decision.reason {
        None => Ok(Json(decision)),
        Some(DenyReason::LimitExceeded) => Err(ApiError::LimitExceeded(Box::new(decision))),
        Some(DenyReason::StoreUnavailable) => Err(ApiError::StoreUnavailable(
            "entitlement store is unavailable".to_string(),
        )),
    }
}

async fn get_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let event_type = match query.event_type.as_deref() {
        None => EventType::ArtifactCreated,
        Some(raw) => EventType::parse(raw)
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown event_type: {raw}")))?,
    };
    let now = Utc::now();
    let snapshot = match query.tier.as_deref() {
        Some(tier) => state
            .entitlements
            .usage(&query.actor_id, tier, event_type, now)
            .await
            .map_err(ApiError::from_entitlement)?,
        None => state
            .entitlements
            .usage_for_actor(&query.actor_id, event_type, now)
            .await
            .map_err(ApiError::from_entitlement)?
            .ok_or(ApiError::NotFound)?,
    };
    Ok(Json(snapshot))
}

async fn ingest_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let provider = provider.trim().to_ascii_lowercase();
    let outcome = state
        .ingest
        .ingest(
            WebhookDelivery {
                provider: &provider,
                raw_payload: &body,
                signature: header_str(&headers, SIGNATURE_HEADER),
                timestamp: header_str(&headers, TIMESTAMP_HEADER),
            },
            Utc::now(),
        )
        .await
        .map_err(ApiError::from_ingest)?;

    match outcome {
        IngestOutcome::Rejected { reason } if reason.is_security() => {
            Err(ApiError::Unauthorized(reason.as_str()))
        }
        IngestOutcome::Rejected { reason } => Err(ApiError::InvalidWebhook(reason.as_str())),
        outcome => Ok(Json(outcome)),
    }
}

async fn get_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let now = Utc::now();
    let record = state
        .progress
        .read(&task_id, now)
        .await
        .map_err(ApiError::from_progress)?
        .ok_or(ApiError::NotFound)?;
    let ttl_remaining_seconds = record.ttl_remaining_seconds(now);
    Ok(Json(ProgressResponse {
        record,
        ttl_remaining_seconds,
    }))
}

async fn put_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<ProgressBody>,
) -> Result<Json<UpsertOutcome>, ApiError> {
    let outcome = state
        .progress
        .upsert(
            ProgressUpdate {
                task_id,
                stage: body.stage,
                sequence: body.sequence,
                payload: body.payload,
            },
            body.ttl_seconds.map(ttl_from_seconds),
            Utc::now(),
        )
        .await
        .map_err(ApiError::from_progress)?;
    Ok(Json(outcome))
}

async fn delete_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .progress
        .delete(&task_id)
        .await
        .map_err(ApiError::from_progress)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    UnknownTier(String),
    NotFound,
    Conflict(String),
    Unauthorized(&'static str),
    InvalidWebhook(&'static str),
    LimitExceeded(Box<AuthorizedDecision>),
    StoreUnavailable(String),
}

impl ApiError {
    fn from_entitlement(error: EntitlementError) -> Self {
        match error {
            EntitlementError::InvalidRequest(message) => Self::InvalidRequest(message),
            EntitlementError::UnknownTier(tier) => Self::UnknownTier(tier),
            EntitlementError::Conflict(message) => Self::Conflict(message),
            EntitlementError::StoreUnavailable(message) => {
                tracing::error!(reason = %message, "entitlement store unavailable");
                Self::StoreUnavailable("entitlement store is unavailable".to_string())
            }
        }
    }

    fn from_ingest(error: IngestError) -> Self {
        tracing::error!(reason = %error, "webhook ingest failed; provider should retry");
        Self::StoreUnavailable(format!("{}: retry later", error.code()))
    }

    fn from_progress(error: ProgressError) -> Self {
        match error {
            ProgressError::InvalidTaskId | ProgressError::InvalidPayload(_) => {
                Self::InvalidRequest(error.to_string())
            }
            ProgressError::StoreUnavailable(message) => {
                tracing::error!(reason = %message, "progress store unavailable");
                Self::StoreUnavailable("progress store is unavailable".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::UnknownTier(tier) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "unknown_tier",
                    "message": format!("tier `{tier}` is not configured"),
                })),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::Conflict(message) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "conflict",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Unauthorized(reason_code) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "webhook authentication failed",
                    "reason_code": reason_code,
                })),
            )
                .into_response(),
            Self::InvalidWebhook(reason_code) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": "webhook payload was rejected",
                    "reason_code": reason_code,
                })),
            )
                .into_response(),
            Self::LimitExceeded(decision) => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": "limit_exceeded",
                    "message": "usage limit reached for the current window",
                    "actor_id": decision.actor_id,
                    "tier": decision.tier,
                    "current": decision.decision.current,
                    "limit": decision.decision.limit,
                    "reset_at": decision.decision.reset_at,
                })),
            )
                .into_response(),
            Self::StoreUnavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "store_unavailable",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}
