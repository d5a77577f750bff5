use axum::{
    extract::rejection::JsonRejection,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use turnstile_core::{CoreError, Rejection};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(CoreError),
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error(transparent)]
    Anyhow(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let mut details = Map::new();

        let (status, code, message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            AppError::RateLimited { retry_after_seconds } => {
                retry_after = Some(retry_after_seconds);
                details.insert("retryAfter".into(), json!(retry_after_seconds));
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "Too many requests".to_string())
            }
            AppError::Core(err) => {
                let code = err.code();
                match err {
                    CoreError::ValidationError(msg) => (StatusCode::BAD_REQUEST, code, msg),
                    CoreError::Rejected(rejection) => {
                        let message = rejection.to_string();
                        let status = match &rejection {
                            Rejection::InvalidQuantity { .. } => StatusCode::BAD_REQUEST,
                            _ => StatusCode::CONFLICT,
                        };
                        match rejection {
                            Rejection::InvalidQuantity { category_id } => {
                                details.insert("categoryId".into(), json!(category_id));
                            }
                            Rejection::InsufficientStock { category_id, available } => {
                                details.insert("categoryId".into(), json!(category_id));
                                details.insert("available".into(), json!(available));
                            }
                            Rejection::HoldNotActive { status } | Rejection::HoldNotClaimed { status } => {
                                details.insert("status".into(), json!(status));
                            }
                            Rejection::NotReady {
                                position,
                                retry_after_seconds,
                            } => {
                                retry_after = Some(retry_after_seconds);
                                details.insert("position".into(), json!(position));
                                details.insert("retryAfter".into(), json!(retry_after_seconds));
                            }
                            Rejection::HoldAlreadyExists | Rejection::InvalidToken | Rejection::InvalidClaimToken => {}
                        }
                        (status, code, message)
                    }
                    CoreError::NotFound(kind) => (StatusCode::NOT_FOUND, code, kind.to_string()),
                    CoreError::StoreError(msg) | CoreError::LedgerError(msg) => {
                        tracing::error!("Infrastructure error ({}): {}", code, msg);
                        (StatusCode::INTERNAL_SERVER_ERROR, code, "Internal Server Error".to_string())
                    }
                }
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal Server Error".to_string(),
                )
            }
        };

        let mut body = Map::new();
        body.insert("success".into(), Value::Bool(false));
        body.insert("error".into(), json!(code));
        body.insert("message".into(), json!(message));
        body.extend(details);

        let mut response = (status, Json(Value::Object(body))).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::ValidationError(rejection.body_text())
    }
}
