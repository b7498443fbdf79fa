use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use super::{json_body, path_id};
use crate::error::BookingError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", post(create_event))
        .route("/events/{id}/seats", get(get_seats))
        .route("/events/{id}/bookings", get(get_event_bookings))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    #[validate(length(min = 1, max = 255, message = "title must be 1 to 255 characters"))]
    pub title: String,
    #[validate(range(min = 1, max = 100_000, message = "seatCount must be between 1 and 100000"))]
    pub seat_count: i32,
}

// POST /api/events
async fn create_event(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateEventRequest>, JsonRejection>,
) -> Result<impl IntoResponse, BookingError> {
    let req = json_body(payload)?;
    req.validate()
        .map_err(|e| BookingError::validation(e.to_string()))?;
    if req.title.trim().is_empty() {
        return Err(BookingError::validation("title must not be blank"));
    }

    let event = state.store.create_event(req.title.trim(), req.seat_count).await?;
    info!("Event {} created with {} seats", event.id, event.seat_count);

    Ok((StatusCode::CREATED, Json(event)))
}

// GET /api/events/{id}/seats
async fn get_seats(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Response, BookingError> {
    let event_id = path_id(id)?;

    if let Some(cache) = &state.cache {
        if let Some(seats) = cache.get_seats(event_id).await {
            return Ok(([("X-Cache", "HIT")], Json(seats)).into_response());
        }
    }

    let seats = state.store.seats_for_event(event_id).await?;
    if seats.is_empty() && state.store.find_event(event_id).await?.is_none() {
        return Err(BookingError::EventNotFound(event_id));
    }

    if let Some(cache) = &state.cache {
        cache.put_seats(event_id, &seats).await;
    }
    Ok(([("X-Cache", "MISS")], Json(seats)).into_response())
}

// GET /api/events/{id}/bookings
async fn get_event_bookings(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, BookingError> {
    let event_id = path_id(id)?;
    if state.store.find_event(event_id).await?.is_none() {
        return Err(BookingError::EventNotFound(event_id));
    }

    let bookings = state.coordinator.bookings_for_event(event_id).await?;
    Ok(Json(bookings))
}
