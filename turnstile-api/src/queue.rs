use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use turnstile_core::queue::{JoinRequest, QueueClaim, QueueStatus};
use turnstile_core::rate_limit::RateLimitAction;
use turnstile_core::{CoreError, NotFoundKind};
use turnstile_shared::{QueueEntryStatus, Selection};

use crate::error::AppError;
use crate::identity::{correlation_header, ClientIdentity};
use crate::required;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JoinQueueRequest {
    pub event_id: String,
    pub selections: Vec<Selection>,
    pub requester_id: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinQueueResponse {
    pub status: QueueEntryStatus,
    pub queue_id: String,
    pub position: u64,
    pub eta_seconds: u64,
    pub claim_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeaveQueueResponse {
    pub success: bool,
    pub status: QueueEntryStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClaimQueueRequest {
    pub queue_id: String,
    pub claim_token: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimQueueResponse {
    pub success: bool,
    #[serde(flatten)]
    pub claim: QueueClaim,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/queue/join", post(join_queue))
        .route("/queue/status/{queue_id}", get(queue_status))
        .route("/queue/leave/{queue_id}", post(leave_queue))
        .route("/queue/claim", post(claim_queue))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /queue/join
pub async fn join_queue(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    headers: HeaderMap,
    payload: Result<Json<JoinQueueRequest>, JsonRejection>,
) -> Result<Json<JoinQueueResponse>, AppError> {
    state.enforce_rate_limit(RateLimitAction::QueueJoin, &client).await?;

    let Json(req) = payload?;
    let event_id = required("eventId", &req.event_id)?;
    let correlation_id = req.correlation_id.or_else(|| correlation_header(&headers));

    let ticket = state
        .queue
        .enqueue(JoinRequest {
            event_id,
            selections: req.selections,
            requester_id: req.requester_id,
            correlation_id: correlation_id.clone(),
            trace_id: req.trace_id,
        })
        .await?;
    state.metrics.queue_joins.inc();

    Ok(Json(JoinQueueResponse {
        status: QueueEntryStatus::Queued,
        queue_id: ticket.queue_id,
        position: ticket.position,
        eta_seconds: ticket.eta_seconds,
        claim_token: ticket.claim_token,
        correlation_id,
    }))
}

/// GET /queue/status/{queueId}
/// Position is recomputed on every call; `ready` is never stored
pub async fn queue_status(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<Json<QueueStatus>, AppError> {
    let status = state.queue.status(&queue_id).await?;
    if status.status == QueueEntryStatus::Expired {
        return Err(CoreError::NotFound(NotFoundKind::QueueExpired).into());
    }
    Ok(Json(status))
}

/// POST /queue/leave/{queueId}
pub async fn leave_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<Json<LeaveQueueResponse>, AppError> {
    if !state.queue.leave(&queue_id).await? {
        return Err(CoreError::NotFound(NotFoundKind::NotInQueue).into());
    }
    Ok(Json(LeaveQueueResponse {
        success: true,
        status: QueueEntryStatus::Cancelled,
    }))
}

/// POST /queue/claim
/// Promote a ready entry straight into a hold
pub async fn claim_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ClaimQueueRequest>, JsonRejection>,
) -> Result<Json<ClaimQueueResponse>, AppError> {
    let Json(req) = payload?;
    let queue_id = required("queueId", &req.queue_id)?;
    if let Some(correlation_id) = req.correlation_id.or_else(|| correlation_header(&headers)) {
        debug!("Queue claim {} (correlation {})", queue_id, correlation_id);
    }

    match state.queue.claim(&queue_id, req.claim_token.as_deref()).await {
        Ok(claim) => {
            state.metrics.holds_acquired.inc();
            Ok(Json(ClaimQueueResponse { success: true, claim }))
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
