use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use turnstile_core::holds::HoldRequest;
use turnstile_core::rate_limit::RateLimitAction;
use turnstile_core::repository::ReleaseOutcome;
use turnstile_core::{CoreError, NotFoundKind};
use turnstile_shared::{HoldEntry, HoldStatus, Selection};

use crate::error::AppError;
use crate::identity::{correlation_header, ClientIdentity};
use crate::state::AppState;
use crate::required;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AttemptHoldRequest {
    pub event_id: String,
    pub selections: Vec<Selection>,
    pub requester_id: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptHoldResponse {
    pub success: bool,
    pub hold_token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_at_epoch: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtendHoldRequest {
    pub hold_token: String,
    pub extend_seconds: Option<u64>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HoldTokenRequest {
    pub hold_token: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimHoldResponse {
    pub success: bool,
    pub entries: Vec<HoldEntry>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseHoldResponse {
    pub success: bool,
    pub status: HoldStatus,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/holds", post(attempt_hold))
        .route("/holds/extend", post(extend_hold))
        .route("/holds/claim", post(claim_hold))
        .route("/holds/release", post(release_hold))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /holds
/// Reserve stock across one or more categories of an event, all or nothing
pub async fn attempt_hold(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    headers: HeaderMap,
    payload: Result<Json<AttemptHoldRequest>, JsonRejection>,
) -> Result<Json<AttemptHoldResponse>, AppError> {
    state.enforce_rate_limit(RateLimitAction::Hold, &client).await?;

    let Json(req) = payload?;
    let event_id = required("eventId", &req.event_id)?;
    if req.selections.is_empty() {
        return Err(AppError::ValidationError("At least one selection is required".into()));
    }

    let request = HoldRequest {
        entries: req
            .selections
            .into_iter()
            .map(|s| HoldEntry {
                event_id: event_id.clone(),
                category_id: s.category_id,
                quantity: s.quantity,
            })
            .collect(),
        event_id,
        requester_id: req.requester_id,
        correlation_id: req.correlation_id.or_else(|| correlation_header(&headers)),
        trace_id: req.trace_id,
    };

    match state.holds.acquire(request).await {
        Ok(grant) => {
            state.metrics.holds_acquired.inc();
            Ok(Json(AttemptHoldResponse {
                success: true,
                hold_token: grant.hold_token,
                expires_at: grant.expires_at,
                expires_at_epoch: grant.expires_at_epoch,
            }))
        }
        Err(e) => {
            if let CoreError::Rejected(rejection) = &e {
                state
                    .metrics
                    .hold_rejections
                    .with_label_values(&[rejection.code()])
                    .inc();
            }
            Err(e.into())
        }
    }
}

/// POST /holds/extend
/// Push a hold's expiry out; never recreates a hold that is already gone
pub async fn extend_hold(
    State(state): State<AppState>,
    payload: Result<Json<ExtendHoldRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(req) = payload?;
    let hold_token = required("holdToken", &req.hold_token)?;
    let seconds = req
        .extend_seconds
        .unwrap_or_else(|| state.holds.settings().effective_ttl());

    if !state.holds.extend(&hold_token, seconds).await? {
        return Err(CoreError::NotFound(NotFoundKind::Hold).into());
    }

    Ok(Json(MessageResponse {
        success: true,
        message: "Hold extended".to_string(),
    }))
}

/// POST /holds/claim
/// Hand a held hold over to checkout; it is no longer swept
pub async fn claim_hold(
    State(state): State<AppState>,
    payload: Result<Json<HoldTokenRequest>, JsonRejection>,
) -> Result<Json<ClaimHoldResponse>, AppError> {
    let Json(req) = payload?;
    let hold_token = required("holdToken", &req.hold_token)?;
    let entries = state.holds.claim(&hold_token).await?;

    Ok(Json(ClaimHoldResponse { success: true, entries }))
}

/// POST /holds/release
/// Return a hold's stock to the pool. A hold that is already gone is a 404
pub async fn release_hold(
    State(state): State<AppState>,
    payload: Result<Json<HoldTokenRequest>, JsonRejection>,
) -> Result<Json<ReleaseHoldResponse>, AppError> {
    let Json(req) = payload?;
    let hold_token = required("holdToken", &req.hold_token)?;

    let status = match state.holds.release(&hold_token).await? {
        ReleaseOutcome::Released => HoldStatus::Released,
        ReleaseOutcome::AlreadyTerminal(status) => status,
    };

    Ok(Json(ReleaseHoldResponse { success: true, status }))
}
