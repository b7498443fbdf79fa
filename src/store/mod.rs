//! Transactional seat store and booking ledger.
//!
//! A [`SeatStore`] is the long-lived handle (pool, lock timeout) built once at
//! startup and shared by the coordinator and the reactor. Every decision that
//! leads to a mutation happens inside a [`StoreTransaction`]: rows are locked
//! first, then read, then written, and all of it is committed or discarded as
//! one unit. Dropping a transaction without committing rolls it back and
//! releases every lock it holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{Booking, BookingStatus, Event, NewBooking, Seat, SeatStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgSeatStore;

#[async_trait]
pub trait SeatStore: Send + Sync {
    /// Opens a transaction at the strongest isolation level the backend offers.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Creates an event together with seats numbered `1..=seat_count`, all
    /// AVAILABLE.
    async fn create_event(&self, title: &str, seat_count: i32) -> Result<Event, StoreError>;

    async fn find_event(&self, event_id: i64) -> Result<Option<Event>, StoreError>;

    /// Committed seat map of an event, ordered by seat number.
    async fn seats_for_event(&self, event_id: i64) -> Result<Vec<Seat>, StoreError>;

    /// Seat numbers for the given ids that belong to `event_id`. Read-only,
    /// used for reporting after a transaction has already been abandoned.
    async fn seat_numbers(&self, event_id: i64, seat_ids: &[i64]) -> Result<Vec<i32>, StoreError>;

    async fn find_booking(&self, booking_id: i64) -> Result<Option<Booking>, StoreError>;

    async fn bookings_for_event(&self, event_id: i64) -> Result<Vec<Booking>, StoreError>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Locks the seats of `event_id` among `seat_ids` in ascending id order
    /// and returns their current state. Ids that do not exist or belong to a
    /// different event are silently absent from the result. Blocks while
    /// another transaction holds one of the rows, up to the lock timeout.
    async fn lock_seats(&mut self, event_id: i64, seat_ids: &[i64]) -> Result<Vec<Seat>, StoreError>;

    /// Sets status and holder of seats this transaction has locked.
    async fn set_seat_status(
        &mut self,
        seat_ids: &[i64],
        status: SeatStatus,
        booking_id: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Appends a PENDING ledger entry. The new row is locked by this
    /// transaction and invisible to others until commit.
    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError>;

    /// Locks one ledger entry, waiting up to the lock timeout.
    async fn lock_booking(&mut self, booking_id: i64) -> Result<Option<Booking>, StoreError>;

    /// Locks up to `limit` PENDING entries whose expiry is before `now`.
    /// Entries already locked elsewhere are skipped rather than waited on.
    async fn lock_expired_bookings(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Advances a locked ledger entry. CONFIRMED stamps `confirmed_at`; any
    /// status other than PENDING clears `expires_at`.
    async fn set_booking_status(
        &mut self,
        booking_id: i64,
        status: BookingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
