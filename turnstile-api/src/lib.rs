use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod holds;
pub mod identity;
pub mod inventory;
pub mod metrics;
pub mod queue;
pub mod state;
pub mod worker;

pub use error::AppError;
pub use metrics::Metrics;
pub use state::{AppState, EngineSettings};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::USER_AGENT,
            header::HeaderName::from_static("x-correlation-id"),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(holds::routes())
        .merge(queue::routes())
        .merge(inventory::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /metrics
async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encode error: {e}"),
        ),
    }
}

/// Trimmed, non-empty identifier from a request body.
pub(crate) fn required(field: &str, value: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::ValidationError(format!("{} is required", field)));
    }
    Ok(value.to_string())
}
