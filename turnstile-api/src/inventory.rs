use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use turnstile_core::inventory::EventInventory;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/inventory/{event_id}", get(get_inventory))
}

/// GET /inventory/{eventId}
/// Live counters where cached, ledger-derived figures otherwise
pub async fn get_inventory(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<EventInventory>, AppError> {
    Ok(Json(state.inventory.get(&event_id).await?))
}
