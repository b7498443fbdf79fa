use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use super::{json_body, path_id};
use crate::error::BookingError;
use crate::services::booking::BookingRequest;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/holds", post(place_hold))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/confirm", post(confirm_hold))
}

// POST /api/bookings
async fn create_booking(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BookingRequest>, JsonRejection>,
) -> Result<impl IntoResponse, BookingError> {
    let req = json_body(payload)?;
    let event_id = req.event_id;

    let confirmation = state.coordinator.attempt_booking(req).await?;
    state.invalidate_seats(event_id).await;

    Ok((StatusCode::CREATED, Json(confirmation)))
}

// POST /api/bookings/holds
async fn place_hold(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BookingRequest>, JsonRejection>,
) -> Result<impl IntoResponse, BookingError> {
    let req = json_body(payload)?;
    let event_id = req.event_id;

    let booking = state.coordinator.place_hold(req).await?;
    state.invalidate_seats(event_id).await;

    Ok((StatusCode::CREATED, Json(booking)))
}

// POST /api/bookings/{id}/confirm
async fn confirm_hold(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, BookingError> {
    let booking_id = path_id(id)?;

    let confirmation = state.coordinator.confirm_hold(booking_id).await?;
    if let Ok(booking) = state.coordinator.find_booking(booking_id).await {
        state.invalidate_seats(booking.event_id).await;
    }

    Ok(Json(confirmation))
}

// GET /api/bookings/{id}
async fn get_booking(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, BookingError> {
    let booking = state.coordinator.find_booking(path_id(id)?).await?;
    Ok(Json(booking))
}
