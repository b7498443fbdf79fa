pub mod bookings;
pub mod events;
pub mod maintenance;

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    extract::Path,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::BookingError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(events::routes())
        .merge(bookings::routes())
        .merge(maintenance::routes())
}

/// Full application router: liveness endpoints plus everything under `/api`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Seat Booking API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// Malformed bodies and path ids get the same `{"error": ...}` shape as every
// other rejection.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, BookingError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| BookingError::validation(rejection.body_text()))
}

fn path_id(id: Result<Path<i64>, PathRejection>) -> Result<i64, BookingError> {
    match id {
        Ok(Path(id)) if id > 0 => Ok(id),
        Ok(Path(id)) => Err(BookingError::validation(format!("id must be a positive integer, got {id}"))),
        Err(rejection) => Err(BookingError::validation(rejection.body_text())),
    }
}
