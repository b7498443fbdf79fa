//! In-process store with the same locking contract as Postgres.
//!
//! Every seat and ledger row owns a `tokio::sync::Mutex<()>`; a transaction
//! holds the owned guard until it commits or is dropped. Writes are buffered
//! in the transaction and applied to the shared state only at commit, while
//! the row guards are still held, so a waiter that acquires the lock next
//! always reads the committed result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{SeatStore, StoreTransaction};
use crate::error::StoreError;
use crate::models::{Booking, BookingStatus, Event, NewBooking, Seat, SeatStatus};

type RowLock = Arc<Mutex<()>>;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    lock_timeout: Duration,
    lock_attempts: AtomicU64,
}

#[derive(Default)]
struct State {
    events: BTreeMap<i64, Event>,
    seats: BTreeMap<i64, Seat>,
    bookings: BTreeMap<i64, Booking>,
    seat_locks: HashMap<i64, RowLock>,
    booking_locks: HashMap<i64, RowLock>,
    next_event_id: i64,
    next_seat_id: i64,
    next_booking_id: i64,
    commit_failure: Option<StoreError>,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                lock_timeout,
                lock_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Number of `lock_seats` calls made against this store so far.
    pub fn lock_attempts(&self) -> u64 {
        self.inner.lock_attempts.load(Ordering::Relaxed)
    }

    /// Makes the next commit fail with `err`. The failing transaction is
    /// discarded exactly as if the backend had aborted it.
    pub async fn fail_next_commit(&self, err: StoreError) {
        self.inner.state.lock().await.commit_failure = Some(err);
    }
}

async fn acquire(lock: RowLock, timeout: Duration) -> Result<OwnedMutexGuard<()>, StoreError> {
    tokio::time::timeout(timeout, lock.lock_owned())
        .await
        .map_err(|_| StoreError::LockTimeout)
}

#[async_trait]
impl SeatStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            seat_guards: HashMap::new(),
            booking_guards: HashMap::new(),
            seat_writes: BTreeMap::new(),
            booking_writes: BTreeMap::new(),
        }))
    }

    async fn create_event(&self, title: &str, seat_count: i32) -> Result<Event, StoreError> {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;

        state.next_event_id += 1;
        let event = Event {
            id: state.next_event_id,
            title: title.to_string(),
            seat_count,
            created_at: now,
        };

        for seat_number in 1..=seat_count {
            state.next_seat_id += 1;
            let id = state.next_seat_id;
            state.seats.insert(
                id,
                Seat {
                    id,
                    event_id: event.id,
                    seat_number,
                    status: SeatStatus::Available,
                    booking_id: None,
                    updated_at: now,
                },
            );
            state.seat_locks.insert(id, Arc::new(Mutex::new(())));
        }

        state.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn find_event(&self, event_id: i64) -> Result<Option<Event>, StoreError> {
        Ok(self.inner.state.lock().await.events.get(&event_id).cloned())
    }

    async fn seats_for_event(&self, event_id: i64) -> Result<Vec<Seat>, StoreError> {
        let state = self.inner.state.lock().await;
        let mut seats: Vec<Seat> = state
            .seats
            .values()
            .filter(|seat| seat.event_id == event_id)
            .cloned()
            .collect();
        seats.sort_by_key(|seat| seat.seat_number);
        Ok(seats)
    }

    async fn seat_numbers(&self, event_id: i64, seat_ids: &[i64]) -> Result<Vec<i32>, StoreError> {
        let state = self.inner.state.lock().await;
        let mut numbers: Vec<i32> = seat_ids
            .iter()
            .filter_map(|id| state.seats.get(id))
            .filter(|seat| seat.event_id == event_id)
            .map(|seat| seat.seat_number)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    async fn find_booking(&self, booking_id: i64) -> Result<Option<Booking>, StoreError> {
        Ok(self.inner.state.lock().await.bookings.get(&booking_id).cloned())
    }

    async fn bookings_for_event(&self, event_id: i64) -> Result<Vec<Booking>, StoreError> {
        let state = self.inner.state.lock().await;
        Ok(state
            .bookings
            .values()
            .filter(|booking| booking.event_id == event_id)
            .cloned()
            .collect())
    }
}

pub struct MemoryTransaction {
    inner: Arc<Inner>,
    seat_guards: HashMap<i64, OwnedMutexGuard<()>>,
    booking_guards: HashMap<i64, OwnedMutexGuard<()>>,
    seat_writes: BTreeMap<i64, Seat>,
    booking_writes: BTreeMap<i64, Booking>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_seats(&mut self, event_id: i64, seat_ids: &[i64]) -> Result<Vec<Seat>, StoreError> {
        self.inner.lock_attempts.fetch_add(1, Ordering::Relaxed);

        let wanted: BTreeSet<i64> = seat_ids.iter().copied().collect();
        let locks: Vec<(i64, RowLock)> = {
            let state = self.inner.state.lock().await;
            wanted
                .into_iter()
                .filter(|id| state.seats.get(id).is_some_and(|seat| seat.event_id == event_id))
                .filter_map(|id| state.seat_locks.get(&id).map(|lock| (id, lock.clone())))
                .collect()
        };

        // Ascending id order, same as ORDER BY id FOR UPDATE.
        for (id, lock) in &locks {
            if self.seat_guards.contains_key(id) {
                continue;
            }
            let guard = acquire(lock.clone(), self.inner.lock_timeout).await?;
            self.seat_guards.insert(*id, guard);
        }

        let state = self.inner.state.lock().await;
        Ok(locks
            .iter()
            .filter_map(|(id, _)| self.seat_writes.get(id).or_else(|| state.seats.get(id)).cloned())
            .collect())
    }

    async fn set_seat_status(
        &mut self,
        seat_ids: &[i64],
        status: SeatStatus,
        booking_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let state = self.inner.state.lock().await;
        for id in seat_ids {
            if !self.seat_guards.contains_key(id) {
                return Err(StoreError::NotLocked(*id));
            }
            let mut seat = match self.seat_writes.get(id).or_else(|| state.seats.get(id)) {
                Some(seat) => seat.clone(),
                None => return Err(StoreError::NotLocked(*id)),
            };
            seat.status = status;
            seat.booking_id = booking_id;
            seat.updated_at = now;
            self.seat_writes.insert(*id, seat);
        }
        Ok(())
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError> {
        let mut state = self.inner.state.lock().await;
        state.next_booking_id += 1;
        let id = state.next_booking_id;

        let lock: RowLock = Arc::new(Mutex::new(()));
        let guard = lock.clone().try_lock_owned().map_err(|_| StoreError::LockTimeout)?;
        state.booking_locks.insert(id, lock);
        drop(state);

        let row = Booking {
            id,
            event_id: booking.event_id,
            seat_ids: booking.seat_ids,
            contact: booking.contact,
            status: BookingStatus::Pending,
            created_at: booking.created_at,
            confirmed_at: None,
            expires_at: Some(booking.expires_at),
        };
        self.booking_guards.insert(id, guard);
        self.booking_writes.insert(id, row.clone());
        Ok(row)
    }

    async fn lock_booking(&mut self, booking_id: i64) -> Result<Option<Booking>, StoreError> {
        if !self.booking_guards.contains_key(&booking_id) {
            let lock = {
                let state = self.inner.state.lock().await;
                if !state.bookings.contains_key(&booking_id) {
                    return Ok(None);
                }
                match state.booking_locks.get(&booking_id) {
                    Some(lock) => lock.clone(),
                    None => return Ok(None),
                }
            };
            let guard = acquire(lock, self.inner.lock_timeout).await?;
            self.booking_guards.insert(booking_id, guard);
        }

        let state = self.inner.state.lock().await;
        Ok(self
            .booking_writes
            .get(&booking_id)
            .or_else(|| state.bookings.get(&booking_id))
            .cloned())
    }

    async fn lock_expired_bookings(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let state = self.inner.state.lock().await;

        let mut claimed = Vec::new();
        for booking in state.bookings.values() {
            if claimed.len() >= limit {
                break;
            }
            if !booking.is_expired_at(now) || self.booking_guards.contains_key(&booking.id) {
                continue;
            }
            let Some(lock) = state.booking_locks.get(&booking.id) else {
                continue;
            };
            // SKIP LOCKED: another sweep (or a confirm) owns it right now.
            if let Ok(guard) = lock.clone().try_lock_owned() {
                self.booking_guards.insert(booking.id, guard);
                claimed.push(booking.clone());
            }
        }
        Ok(claimed)
    }

    async fn set_booking_status(
        &mut self,
        booking_id: i64,
        status: BookingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !self.booking_guards.contains_key(&booking_id) {
            return Err(StoreError::NotLocked(booking_id));
        }
        let state = self.inner.state.lock().await;
        let mut booking = match self
            .booking_writes
            .get(&booking_id)
            .or_else(|| state.bookings.get(&booking_id))
        {
            Some(booking) => booking.clone(),
            None => return Err(StoreError::NotLocked(booking_id)),
        };
        drop(state);

        booking.status = status;
        if status == BookingStatus::Confirmed {
            booking.confirmed_at = Some(at);
        }
        if status != BookingStatus::Pending {
            booking.expires_at = None;
        }
        self.booking_writes.insert(booking_id, booking);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = *self;
        let inner = tx.inner.clone();
        let mut state = inner.state.lock().await;

        if let Some(err) = state.commit_failure.take() {
            debug!("memory store: injected commit failure");
            return Err(err);
        }

        for (id, seat) in std::mem::take(&mut tx.seat_writes) {
            state.seats.insert(id, seat);
        }
        for (id, booking) in std::mem::take(&mut tx.booking_writes) {
            state.bookings.insert(id, booking);
        }
        drop(state);

        // Row guards go last so the next holder sees the applied writes.
        drop(tx);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!(
            "memory store: rollback, releasing {} seat and {} booking locks",
            self.seat_guards.len(),
            self.booking_guards.len()
        );
        Ok(())
    }
}
