//! Postgres backend.
//!
//! Each transaction runs SERIALIZABLE with a `lock_timeout`, and row locks
//! come from `SELECT ... FOR UPDATE` ordered by id. The row lock is what
//! actually serializes contenders; SERIALIZABLE only catches what slips past
//! it, and its failures surface as [`StoreError::Serialization`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, Postgres, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use super::{SeatStore, StoreTransaction};
use crate::database::Database;
use crate::error::StoreError;
use crate::models::{Booking, BookingStatus, Event, NewBooking, Seat, SeatStatus};

const SEAT_COLUMNS: &str = "id, event_id, seat_number, status, booking_id, updated_at";
const BOOKING_COLUMNS: &str =
    "id, event_id, seat_ids, contact, status, created_at, confirmed_at, expires_at";

#[derive(FromRow)]
struct SeatRow {
    id: i64,
    event_id: i64,
    seat_number: i32,
    status: String,
    booking_id: Option<i64>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SeatRow> for Seat {
    type Error = StoreError;

    fn try_from(row: SeatRow) -> Result<Self, Self::Error> {
        Ok(Seat {
            id: row.id,
            event_id: row.event_id,
            seat_number: row.seat_number,
            status: row.status.parse()?,
            booking_id: row.booking_id,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct BookingRow {
    id: i64,
    event_id: i64,
    seat_ids: Vec<i64>,
    contact: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            event_id: row.event_id,
            seat_ids: row.seat_ids,
            contact: row.contact,
            status: row.status.parse()?,
            created_at: row.created_at,
            confirmed_at: row.confirmed_at,
            expires_at: row.expires_at,
        })
    }
}

fn seats_from_rows(rows: Vec<SeatRow>) -> Result<Vec<Seat>, StoreError> {
    rows.into_iter().map(Seat::try_from).collect()
}

fn bookings_from_rows(rows: Vec<BookingRow>) -> Result<Vec<Booking>, StoreError> {
    rows.into_iter().map(Booking::try_from).collect()
}

#[derive(Clone)]
pub struct PgSeatStore {
    db: Database,
    lock_timeout: Duration,
}

impl PgSeatStore {
    pub fn new(db: Database, lock_timeout: Duration) -> Self {
        Self { db, lock_timeout }
    }
}

#[async_trait]
impl SeatStore for PgSeatStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let mut tx = self.db.pool.begin().await?;

        // Must be the first statement of the transaction.
        (&mut *tx).execute("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").await?;
        let lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        (&mut *tx).execute(lock_timeout.as_str()).await?;

        Ok(Box::new(PgTransaction {
            tx,
            locked_seats: HashSet::new(),
            locked_bookings: HashSet::new(),
        }))
    }

    async fn create_event(&self, title: &str, seat_count: i32) -> Result<Event, StoreError> {
        let mut tx = self.db.pool.begin().await?;

        let event = sqlx::query_as::<_, Event>(
            "INSERT INTO events (title, seat_count)
             VALUES ($1, $2)
             RETURNING id, title, seat_count, created_at",
        )
        .bind(title)
        .bind(seat_count)
        .fetch_one(&mut *tx)
        .await?;

        let created = sqlx::query(
            "INSERT INTO seats (event_id, seat_number)
             SELECT $1, n FROM generate_series(1, $2) AS n",
        )
        .bind(event.id)
        .bind(seat_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("event {} created with {} seats", event.id, created.rows_affected());
        Ok(event)
    }

    async fn find_event(&self, event_id: i64) -> Result<Option<Event>, StoreError> {
        let event = sqlx::query_as::<_, Event>(
            "SELECT id, title, seat_count, created_at FROM events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(event)
    }

    async fn seats_for_event(&self, event_id: i64) -> Result<Vec<Seat>, StoreError> {
        let rows = sqlx::query_as::<_, SeatRow>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE event_id = $1 ORDER BY seat_number"
        ))
        .bind(event_id)
        .fetch_all(&self.db.pool)
        .await?;
        seats_from_rows(rows)
    }

    async fn seat_numbers(&self, event_id: i64, seat_ids: &[i64]) -> Result<Vec<i32>, StoreError> {
        let numbers = sqlx::query_scalar::<_, i32>(
            "SELECT seat_number FROM seats
             WHERE event_id = $1 AND id = ANY($2)
             ORDER BY seat_number",
        )
        .bind(event_id)
        .bind(seat_ids)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(numbers)
    }

    async fn find_booking(&self, booking_id: i64) -> Result<Option<Booking>, StoreError> {
        sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"
        ))
        .bind(booking_id)
        .fetch_optional(&self.db.pool)
        .await?
        .map(Booking::try_from)
        .transpose()
    }

    async fn bookings_for_event(&self, event_id: i64) -> Result<Vec<Booking>, StoreError> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE event_id = $1 ORDER BY id"
        ))
        .bind(event_id)
        .fetch_all(&self.db.pool)
        .await?;
        bookings_from_rows(rows)
    }
}

/// Dropping without commit hands the connection back to the pool, which
/// rolls the transaction back and releases its row locks.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    locked_seats: HashSet<i64>,
    locked_bookings: HashSet<i64>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn lock_seats(&mut self, event_id: i64, seat_ids: &[i64]) -> Result<Vec<Seat>, StoreError> {
        let rows = sqlx::query_as::<_, SeatRow>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats
             WHERE event_id = $1 AND id = ANY($2)
             ORDER BY id
             FOR UPDATE"
        ))
        .bind(event_id)
        .bind(seat_ids)
        .fetch_all(&mut *self.tx)
        .await?;

        let seats = seats_from_rows(rows)?;
        self.locked_seats.extend(seats.iter().map(|seat| seat.id));
        Ok(seats)
    }

    async fn set_seat_status(
        &mut self,
        seat_ids: &[i64],
        status: SeatStatus,
        booking_id: Option<i64>,
    ) -> Result<(), StoreError> {
        if let Some(id) = seat_ids.iter().find(|id| !self.locked_seats.contains(id)) {
            return Err(StoreError::NotLocked(*id));
        }

        sqlx::query(
            "UPDATE seats
             SET status = $1, booking_id = $2, updated_at = NOW()
             WHERE id = ANY($3)",
        )
        .bind(status.as_str())
        .bind(booking_id)
        .bind(seat_ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "INSERT INTO bookings (event_id, seat_ids, contact, status, created_at, expires_at)
             VALUES ($1, $2, $3, 'PENDING', $4, $5)
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(booking.event_id)
        .bind(&booking.seat_ids)
        .bind(&booking.contact)
        .bind(booking.created_at)
        .bind(booking.expires_at)
        .fetch_one(&mut *self.tx)
        .await?;

        let booking = Booking::try_from(row)?;
        self.locked_bookings.insert(booking.id);
        Ok(booking)
    }

    async fn lock_booking(&mut self, booking_id: i64) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE"
        ))
        .bind(booking_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let booking = row.map(Booking::try_from).transpose()?;
        if booking.is_some() {
            self.locked_bookings.insert(booking_id);
        }
        Ok(booking)
    }

    async fn lock_expired_bookings(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE status = 'PENDING' AND expires_at < $1
             ORDER BY id
             LIMIT $2
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;

        let bookings = bookings_from_rows(rows)?;
        self.locked_bookings.extend(bookings.iter().map(|booking| booking.id));
        Ok(bookings)
    }

    async fn set_booking_status(
        &mut self,
        booking_id: i64,
        status: BookingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !self.locked_bookings.contains(&booking_id) {
            return Err(StoreError::NotLocked(booking_id));
        }

        sqlx::query(
            "UPDATE bookings
             SET status = $2,
                 confirmed_at = CASE WHEN $2 = 'CONFIRMED' THEN $3 ELSE confirmed_at END,
                 expires_at = CASE WHEN $2 = 'PENDING' THEN expires_at ELSE NULL END
             WHERE id = $1",
        )
        .bind(booking_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
