//! HTTP API endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use keygate_core::types::iso8601;
use keygate_core::{EngineError, Outcome, VerificationEngine};

use crate::metrics::VerifyMetrics;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<VerificationEngine>,
    pub rate_limiter: RateLimiter,
    pub metrics: Arc<VerifyMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub license_key: String,
    #[serde(default)]
    pub hwid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyResponse {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl VerifyResponse {
    fn success(message: &str, expires_at: Option<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            expires_at,
        }
    }

    fn error(message: impl Into<String>, expires_at: Option<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            expires_at,
        }
    }
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/verify", post(verify_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Map a verification outcome to its HTTP status and body.
pub fn outcome_response(outcome: &Outcome) -> (StatusCode, VerifyResponse) {
    let expires_at = outcome.expires_at().map(|dt| iso8601::format(&dt));
    match outcome {
        Outcome::Valid { .. } => (
            StatusCode::OK,
            VerifyResponse::success("License is valid", expires_at),
        ),
        Outcome::Expired { .. } => (
            StatusCode::OK,
            VerifyResponse::error("License has expired", expires_at),
        ),
        Outcome::Bound { .. } => (
            StatusCode::OK,
            VerifyResponse::error("License is already in use on another device", expires_at),
        ),
        Outcome::NotFound => (
            StatusCode::BAD_REQUEST,
            VerifyResponse::error("Invalid license key", None),
        ),
    }
}

/// GET / - liveness banner
async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "License API Server is running" }))
}

/// POST /verify - verify a license key, binding it on first use
async fn verify_handler(
    State(state): State<ApiState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response {
    // Requests without connection info (in-process callers) are not limited
    if let Some(ConnectInfo(addr)) = connect_info {
        if let Err(retry_after) = state.rate_limiter.check(addr.ip()) {
            warn!("Rate limit exceeded for {}", addr.ip());
            state.metrics.rate_limit_hits.inc();
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(VerifyResponse::error("Too many requests", None)),
            )
                .into_response();
        }
    }

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected verify request: {}", rejection.body_text());
            return invalid_request(&state, rejection.body_text());
        }
    };

    if request.license_key.is_empty() {
        return invalid_request(&state, "license_key must not be empty");
    }

    let _timer = state.metrics.request_latency.start_timer();

    match state
        .engine
        .verify(&request.license_key, request.hwid.as_deref())
        .await
    {
        Ok(outcome) => {
            debug!("Verified license {}: {}", request.license_key, outcome.label());
            state.metrics.record_outcome(&outcome);
            let (status, body) = outcome_response(&outcome);
            (status, Json(body)).into_response()
        }
        Err(EngineError::MissingHardwareId(_)) => {
            invalid_request(&state, "hwid is required for this license server")
        }
        Err(EngineError::Contention { key, attempts }) => {
            warn!("Gave up on license {} after {} contended attempts", key, attempts);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(VerifyResponse::error("License is busy, please retry", None)),
            )
                .into_response()
        }
        Err(EngineError::Store(e)) => {
            error!("Storage error verifying {}: {}", request.license_key, e);
            state.metrics.storage_errors.inc();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(VerifyResponse::error("Internal server error", None)),
            )
                .into_response()
        }
    }
}

fn invalid_request(state: &ApiState, message: impl Into<String>) -> Response {
    state.metrics.invalid_requests.inc();
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(VerifyResponse::error(message, None)),
    )
        .into_response()
}

/// GET /health - health check
async fn health_handler() -> Response {
    let response = json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response)).into_response()
}

/// GET /metrics - prometheus exposition
async fn metrics_handler(State(state): State<ApiState>) -> Response {
    match state.metrics.export_prometheus() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
