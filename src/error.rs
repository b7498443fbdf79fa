//! Error types shared by the store, the booking coordinator and the expiry
//! reactor.
//!
//! [`StoreError`] is what a store backend reports. [`BookingError`] is the
//! taxonomy callers see: validation, seat mismatch, conflict, not-found,
//! transient and fatal. Only recognized store conflict signals turn into
//! [`BookingError::Conflict`]; anything unrecognized escalates to
//! [`BookingError::Fatal`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::UnknownStatus;

// Postgres SQLSTATE codes we react to.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A row lock could not be acquired within the configured wait.
    #[error("timed out waiting for a row lock")]
    LockTimeout,

    /// The store aborted the transaction to preserve serializability.
    #[error("transaction could not be serialized")]
    Serialization,

    /// Pool exhausted, connection dropped or similar.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A mutation touched a row the transaction never locked.
    #[error("row {0} is not locked by this transaction")]
    NotLocked(i64),

    #[error(transparent)]
    Corrupt(#[from] UnknownStatus),

    #[error(transparent)]
    Database(sqlx::Error),
}

impl StoreError {
    /// Lock timeouts and connectivity failures may succeed on a plain retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout | StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
            _ => None,
        };
        match code.as_deref() {
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => return StoreError::Serialization,
            Some(LOCK_NOT_AVAILABLE) => return StoreError::LockTimeout,
            _ => {}
        }

        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum BookingError {
    /// Malformed or oversized request; retrying unchanged will fail again.
    #[error("{0}")]
    Validation(String),

    /// A named seat does not belong to the named event.
    #[error("one or more seats do not belong to event {event_id}")]
    SeatMismatch { event_id: i64 },

    /// Seats were taken at lock time, or the store reported a serialization
    /// failure. Retryable after refreshing availability.
    #[error("seats unavailable")]
    Conflict { unavailable_seats: Vec<i32> },

    #[error("booking {0} not found")]
    NotFound(i64),

    #[error("event {0} not found")]
    EventNotFound(i64),

    #[error("store temporarily unavailable")]
    Transient(#[source] StoreError),

    #[error("internal error")]
    Fatal(#[source] StoreError),
}

impl BookingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BookingError::Validation(message.into())
    }

    pub fn conflict(unavailable_seats: Vec<i32>) -> Self {
        BookingError::Conflict { unavailable_seats }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::Conflict { .. } | BookingError::Transient(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            BookingError::Validation(_) | BookingError::SeatMismatch { .. } => StatusCode::BAD_REQUEST,
            BookingError::Conflict { .. } => StatusCode::CONFLICT,
            BookingError::NotFound(_) | BookingError::EventNotFound(_) => StatusCode::NOT_FOUND,
            BookingError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            BookingError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Store errors that reach this conversion were not recognized as a conflict
/// by the caller, so they are either transient or fatal.
impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            BookingError::Transient(err)
        } else {
            BookingError::Fatal(err)
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            BookingError::Conflict { unavailable_seats } => json!({
                "error": "seats unavailable",
                "unavailableSeats": unavailable_seats,
            }),
            BookingError::Transient(source) => {
                tracing::warn!("transient store failure: {}", source);
                json!({ "error": "service temporarily unavailable, retry later" })
            }
            BookingError::Fatal(source) => {
                tracing::error!("fatal store failure: {:?}", source);
                json!({ "error": "internal error" })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
