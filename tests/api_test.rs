use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use seat_booking::config::BookingConfig;
use seat_booking::controllers;
use seat_booking::store::MemoryStore;
use seat_booking::AppState;

fn app() -> Router {
    let booking = BookingConfig {
        reservation_window_secs: 120,
        sweep_interval_secs: 60,
        sweep_batch_size: 100,
    };
    let store = Arc::new(MemoryStore::new(Duration::from_millis(500)));
    controllers::router(AppState::new(store, None, &booking))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn create_event(app: &Router, seat_count: i32) -> i64 {
    let (status, body) = send(app, "POST", "/api/events", Some(json!({ "title": "Gala", "seatCount": seat_count }))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_i64().unwrap()
}

#[tokio::test]
async fn health_check() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn new_event_has_contiguous_available_seats() {
    let app = app();
    let event_id = create_event(&app, 4).await;

    let (status, seats) = send(&app, "GET", &format!("/api/events/{event_id}/seats"), None).await;
    assert_eq!(status, StatusCode::OK);
    let seats = seats.as_array().unwrap();
    assert_eq!(seats.len(), 4);
    for (i, seat) in seats.iter().enumerate() {
        assert_eq!(seat["seatNumber"], json!(i + 1));
        assert_eq!(seat["status"], "AVAILABLE");
        assert_eq!(seat["bookingId"], Value::Null);
    }
}

#[tokio::test]
async fn booking_then_conflict() {
    let app = app();
    let event_id = create_event(&app, 5).await;
    let request = json!({ "eventId": event_id, "seatIds": [2, 1], "contact": "fan@example.com" });

    let (status, body) = send(&app, "POST", "/api/bookings", Some(request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "CONFIRMED");
    assert_eq!(body["seatIds"], json!([1, 2]));
    let booking_id = body["bookingId"].as_i64().unwrap();

    let (status, body) = send(&app, "POST", "/api/bookings", Some(request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, json!({ "error": "seats unavailable", "unavailableSeats": [1, 2] }));

    let (status, body) = send(&app, "GET", &format!("/api/bookings/{booking_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["contact"], "fan@example.com");
    assert_eq!(body["expiresAt"], Value::Null);

    let (status, body) = send(&app, "GET", &format!("/api/events/{event_id}/bookings"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn bad_requests_are_400() {
    let app = app();
    let event_id = create_event(&app, 20).await;

    let eleven: Vec<i64> = (1..=11).collect();
    for body in [
        json!({ "eventId": event_id, "seatIds": eleven }),
        json!({ "eventId": event_id, "seatIds": [] }),
        json!({ "eventId": event_id, "seatIds": [0] }),
        json!({ "eventId": 0, "seatIds": [1] }),
        json!({ "seatIds": [1] }),
    ] {
        let (status, response) = send(&app, "POST", "/api/bookings", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response["error"].is_string());
    }

    let (status, _) = send(&app, "POST", "/api/events", Some(json!({ "title": "", "seatCount": 5 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, "POST", "/api/events", Some(json!({ "title": "Huge", "seatCount": 0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn seat_from_another_event_is_400() {
    let app = app();
    let first = create_event(&app, 3).await;
    let _second = create_event(&app, 3).await;

    // Seat ids 4..=6 belong to the second event.
    let (status, body) = send(&app, "POST", "/api/bookings", Some(json!({ "eventId": first, "seatIds": [1, 4] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains(&first.to_string()));
}

#[tokio::test]
async fn unknown_resources_are_404() {
    let app = app();
    let (status, body) = send(&app, "GET", "/api/bookings/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "booking 999 not found");

    let (status, _) = send(&app, "GET", "/api/events/42/seats", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/api/bookings/999/confirm", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn hold_confirm_and_sweep() {
    let app = app();
    let event_id = create_event(&app, 3).await;

    let (status, hold) = send(&app, "POST", "/api/bookings/holds", Some(json!({ "eventId": event_id, "seatIds": [3] }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(hold["status"], "PENDING");
    assert!(hold["expiresAt"].is_string());
    let hold_id = hold["bookingId"].as_i64().unwrap();

    let (_, seats) = send(&app, "GET", &format!("/api/events/{event_id}/seats"), None).await;
    assert_eq!(seats[2]["status"], "RESERVED");

    // The hold is still inside its window.
    let (status, report) = send(&app, "POST", "/api/maintenance/expire", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report, json!({ "expired": 0, "releasedSeats": 0 }));

    let (status, confirmation) = send(&app, "POST", &format!("/api/bookings/{hold_id}/confirm"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmation["status"], "CONFIRMED");
    assert_eq!(confirmation["seatIds"], json!([3]));

    let (_, seats) = send(&app, "GET", &format!("/api/events/{event_id}/seats"), None).await;
    assert_eq!(seats[2]["status"], "BOOKED");
}
