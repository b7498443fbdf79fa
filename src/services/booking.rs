//! Booking transaction coordinator.
//!
//! One booking attempt is one store transaction:
//!
//! 1. normalize the requested seat ids (before touching the store at all);
//! 2. lock exactly those seats, scoped to the event;
//! 3. reject on a seat/event mismatch or on any seat that is not AVAILABLE;
//! 4. write the ledger entry and the seat status changes;
//! 5. commit, or roll back on every other exit path.
//!
//! Nothing here retries. A serialization failure reported by the store is
//! handed back to the caller as [`BookingError::Conflict`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::error::{BookingError, StoreError};
use crate::models::{Booking, BookingStatus, NewBooking, Seat, SeatStatus};
use crate::store::{SeatStore, StoreTransaction};

pub const MAX_SEATS_PER_BOOKING: usize = 10;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    #[validate(range(min = 1, message = "eventId must be a positive integer"))]
    pub event_id: i64,
    pub seat_ids: Vec<i64>,
    #[validate(length(max = 255, message = "contact must be at most 255 characters"))]
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfirmation {
    pub booking_id: i64,
    pub status: BookingStatus,
    pub seat_ids: Vec<i64>,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct BookingSettings {
    /// How long a PENDING entry protects its seats.
    pub reservation_window: Duration,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self { reservation_window: Duration::minutes(2) }
    }
}

/// Sorts and deduplicates seat ids, then checks the 1..=10 bound.
pub fn normalize_seat_ids(seat_ids: &[i64]) -> Result<Vec<i64>, BookingError> {
    if seat_ids.iter().any(|id| *id <= 0) {
        return Err(BookingError::validation("seatIds must be positive integers"));
    }

    let unique: BTreeSet<i64> = seat_ids.iter().copied().collect();
    if unique.is_empty() {
        return Err(BookingError::validation("at least one seat must be requested"));
    }
    if unique.len() > MAX_SEATS_PER_BOOKING {
        return Err(BookingError::validation(format!(
            "at most {MAX_SEATS_PER_BOOKING} seats can be booked at once"
        )));
    }
    Ok(unique.into_iter().collect())
}

/// Why a transaction body stopped short of commit.
enum Abort {
    Rejected(BookingError),
    Store(StoreError),
}

impl From<StoreError> for Abort {
    fn from(err: StoreError) -> Self {
        Abort::Store(err)
    }
}

impl From<BookingError> for Abort {
    fn from(err: BookingError) -> Self {
        Abort::Rejected(err)
    }
}

#[derive(Clone)]
pub struct BookingCoordinator {
    store: Arc<dyn SeatStore>,
    settings: BookingSettings,
}

impl BookingCoordinator {
    pub fn new(store: Arc<dyn SeatStore>, settings: BookingSettings) -> Self {
        Self { store, settings }
    }

    /// Books the requested seats and confirms the booking in the same
    /// transaction.
    pub async fn attempt_booking(&self, request: BookingRequest) -> Result<BookingConfirmation, BookingError> {
        let seat_ids = Self::validate(&request)?;
        let event_id = request.event_id;
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        let outcome = self
            .book_within(tx.as_mut(), event_id, &seat_ids, request.contact, now)
            .await;

        match Self::finish(tx, outcome).await {
            Ok(booking) => {
                info!("Booking {} confirmed: event {} seats {:?}", booking.id, event_id, seat_ids);
                Ok(BookingConfirmation {
                    booking_id: booking.id,
                    status: BookingStatus::Confirmed,
                    seat_ids,
                    confirmed_at: now,
                })
            }
            Err(abort) => Err(self.resolve(abort, event_id, &seat_ids).await),
        }
    }

    /// Reserves the seats behind a PENDING entry that expires after the
    /// reservation window unless [`confirm_hold`](Self::confirm_hold) runs
    /// first.
    pub async fn place_hold(&self, request: BookingRequest) -> Result<Booking, BookingError> {
        let seat_ids = Self::validate(&request)?;
        let event_id = request.event_id;
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        let outcome = async {
            Self::lock_available(tx.as_mut(), event_id, &seat_ids).await?;
            self.reserve(tx.as_mut(), event_id, &seat_ids, request.contact, now).await
        }
        .await;

        match Self::finish(tx, outcome).await {
            Ok(booking) => {
                info!(
                    "Hold {} placed: event {} seats {:?} until {:?}",
                    booking.id, event_id, seat_ids, booking.expires_at
                );
                Ok(booking)
            }
            Err(abort) => Err(self.resolve(abort, event_id, &seat_ids).await),
        }
    }

    /// Turns a live hold into a confirmed booking. Confirming an already
    /// confirmed booking returns the original confirmation.
    pub async fn confirm_hold(&self, booking_id: i64) -> Result<BookingConfirmation, BookingError> {
        if booking_id <= 0 {
            return Err(BookingError::validation("bookingId must be a positive integer"));
        }
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        let outcome = Self::confirm_within(tx.as_mut(), booking_id, now).await;

        match Self::finish(tx, outcome).await {
            Ok(confirmation) => {
                info!("Hold {} confirmed", booking_id);
                Ok(confirmation)
            }
            Err(Abort::Store(StoreError::Serialization)) => {
                warn!("Confirm of booking {} hit a serialization failure", booking_id);
                let unavailable = match self.store.find_booking(booking_id).await {
                    Ok(Some(booking)) => self.seat_numbers_or_empty(booking.event_id, &booking.seat_ids).await,
                    _ => Vec::new(),
                };
                Err(BookingError::conflict(unavailable))
            }
            Err(abort) => Err(self.resolve(abort, 0, &[]).await),
        }
    }

    pub async fn find_booking(&self, booking_id: i64) -> Result<Booking, BookingError> {
        self.store
            .find_booking(booking_id)
            .await?
            .ok_or(BookingError::NotFound(booking_id))
    }

    pub async fn bookings_for_event(&self, event_id: i64) -> Result<Vec<Booking>, BookingError> {
        Ok(self.store.bookings_for_event(event_id).await?)
    }

    fn validate(request: &BookingRequest) -> Result<Vec<i64>, BookingError> {
        request
            .validate()
            .map_err(|e| BookingError::validation(e.to_string()))?;
        normalize_seat_ids(&request.seat_ids)
    }

    async fn book_within(
        &self,
        tx: &mut dyn StoreTransaction,
        event_id: i64,
        seat_ids: &[i64],
        contact: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Booking, Abort> {
        Self::lock_available(tx, event_id, seat_ids).await?;
        let booking = self.reserve(tx, event_id, seat_ids, contact, now).await?;

        // Synchronous confirm: PENDING never outlives this transaction.
        tx.set_booking_status(booking.id, BookingStatus::Confirmed, now).await?;
        tx.set_seat_status(seat_ids, SeatStatus::Booked, Some(booking.id)).await?;
        Ok(booking)
    }

    async fn lock_available(
        tx: &mut dyn StoreTransaction,
        event_id: i64,
        seat_ids: &[i64],
    ) -> Result<Vec<Seat>, Abort> {
        let seats = tx.lock_seats(event_id, seat_ids).await?;

        if seats.len() != seat_ids.len() {
            debug!(
                "Event {}: locked {} of {} requested seats, rejecting",
                event_id,
                seats.len(),
                seat_ids.len()
            );
            return Err(BookingError::SeatMismatch { event_id }.into());
        }

        let mut taken: Vec<i32> = seats
            .iter()
            .filter(|seat| !seat.is_available())
            .map(|seat| seat.seat_number)
            .collect();
        if !taken.is_empty() {
            taken.sort_unstable();
            debug!("Event {}: seats {:?} already taken", event_id, taken);
            return Err(BookingError::conflict(taken).into());
        }

        Ok(seats)
    }

    async fn reserve(
        &self,
        tx: &mut dyn StoreTransaction,
        event_id: i64,
        seat_ids: &[i64],
        contact: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Booking, Abort> {
        let booking = tx
            .insert_booking(NewBooking {
                event_id,
                seat_ids: seat_ids.to_vec(),
                contact,
                created_at: now,
                expires_at: now + self.settings.reservation_window,
            })
            .await?;
        tx.set_seat_status(seat_ids, SeatStatus::Reserved, Some(booking.id)).await?;
        Ok(booking)
    }

    async fn confirm_within(
        tx: &mut dyn StoreTransaction,
        booking_id: i64,
        now: DateTime<Utc>,
    ) -> Result<BookingConfirmation, Abort> {
        let booking = tx
            .lock_booking(booking_id)
            .await?
            .ok_or(BookingError::NotFound(booking_id))?;

        if booking.status == BookingStatus::Confirmed {
            return Ok(BookingConfirmation {
                booking_id,
                status: BookingStatus::Confirmed,
                seat_ids: booking.seat_ids,
                confirmed_at: booking.confirmed_at.unwrap_or(booking.created_at),
            });
        }

        let seats = tx.lock_seats(booking.event_id, &booking.seat_ids).await?;
        let all_numbers = || {
            let mut numbers: Vec<i32> = seats.iter().map(|seat| seat.seat_number).collect();
            numbers.sort_unstable();
            numbers
        };

        if booking.status == BookingStatus::Failed || booking.is_expired_at(now) {
            debug!("Booking {} is no longer confirmable ({})", booking_id, booking.status);
            return Err(BookingError::conflict(all_numbers()).into());
        }

        let mut lost: Vec<i32> = seats
            .iter()
            .filter(|seat| !seat.is_held_by(booking_id))
            .map(|seat| seat.seat_number)
            .collect();
        if !lost.is_empty() || seats.len() != booking.seat_ids.len() {
            warn!("Booking {} no longer holds seats {:?}", booking_id, lost);
            if lost.is_empty() {
                lost = all_numbers();
            }
            lost.sort_unstable();
            return Err(BookingError::conflict(lost).into());
        }

        tx.set_seat_status(&booking.seat_ids, SeatStatus::Booked, Some(booking_id)).await?;
        tx.set_booking_status(booking_id, BookingStatus::Confirmed, now).await?;

        Ok(BookingConfirmation {
            booking_id,
            status: BookingStatus::Confirmed,
            seat_ids: booking.seat_ids,
            confirmed_at: now,
        })
    }

    /// Commits on success, rolls back otherwise. Either way the transaction
    /// and all of its locks are gone when this returns.
    async fn finish<T: Send>(tx: Box<dyn StoreTransaction>, outcome: Result<T, Abort>) -> Result<T, Abort> {
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(abort) => {
                if let Err(e) = tx.rollback().await {
                    warn!("Rollback failed, connection will be discarded: {}", e);
                }
                Err(abort)
            }
        }
    }

    async fn resolve(&self, abort: Abort, event_id: i64, seat_ids: &[i64]) -> BookingError {
        match abort {
            Abort::Rejected(err) => err,
            Abort::Store(StoreError::Serialization) => {
                warn!("Event {}: serialization failure while booking {:?}", event_id, seat_ids);
                BookingError::conflict(self.seat_numbers_or_empty(event_id, seat_ids).await)
            }
            Abort::Store(err) => {
                if err.is_transient() {
                    warn!("Event {}: transient store failure: {}", event_id, err);
                } else {
                    error!("Event {}: booking aborted: {:?}", event_id, err);
                }
                BookingError::from(err)
            }
        }
    }

    /// Reporting only; runs after rollback and decides nothing.
    async fn seat_numbers_or_empty(&self, event_id: i64, seat_ids: &[i64]) -> Vec<i32> {
        if seat_ids.is_empty() {
            return Vec::new();
        }
        match self.store.seat_numbers(event_id, seat_ids).await {
            Ok(numbers) => numbers,
            Err(e) => {
                warn!("Could not resolve seat numbers for conflict report: {}", e);
                Vec::new()
            }
        }
    }
}
