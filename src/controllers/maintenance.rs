use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use std::sync::Arc;

use crate::error::BookingError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/maintenance/expire", post(expire_now))
}

// POST /api/maintenance/expire
// Runs one expiry sweep out of schedule.
async fn expire_now(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, BookingError> {
    let report = state.run_expiry_sweep().await?;
    Ok(Json(report))
}
