use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{BookingError, StoreError};
use crate::models::{BookingStatus, Seat, SeatStatus};
use crate::store::{SeatStore, StoreTransaction};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Ledger entries moved from PENDING to FAILED.
    pub expired: u64,
    pub released_seats: u64,
    /// Events whose seat map changed.
    #[serde(skip)]
    pub events: BTreeSet<i64>,
}

/// Reclaims seats behind PENDING entries whose reservation window has passed.
pub struct ExpiryReactor {
    store: Arc<dyn SeatStore>,
    batch_size: i64,
}

impl ExpiryReactor {
    pub fn new(store: Arc<dyn SeatStore>, batch_size: i64) -> Self {
        Self { store, batch_size }
    }

    /// Safe to run repeatedly and concurrently: entries another sweep has
    /// already claimed are skipped, and FAILED entries never match again.
    pub async fn run_expiry_sweep(&self) -> Result<SweepReport, BookingError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, BookingError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.sweep_within(tx.as_mut(), now).await;

        match outcome {
            Ok(report) if report.expired == 0 => {
                // Nothing written; let the empty transaction go.
                if let Err(e) = tx.rollback().await {
                    warn!("🧹 Empty sweep rollback failed: {}", e);
                }
                debug!("🧹 No expired holds");
                Ok(report)
            }
            Ok(report) => match tx.commit().await {
                Ok(()) => {
                    info!(
                        "🧹 Expired {} holds, released {} seats across {} events",
                        report.expired,
                        report.released_seats,
                        report.events.len()
                    );
                    Ok(report)
                }
                Err(e) => Err(Self::sweep_error(e)),
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("🧹 Sweep rollback failed: {}", rollback_err);
                }
                Err(Self::sweep_error(e))
            }
        }
    }

    async fn sweep_within(
        &self,
        tx: &mut dyn StoreTransaction,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, StoreError> {
        let expired = tx.lock_expired_bookings(now, self.batch_size).await?;
        let mut report = SweepReport::default();
        if expired.is_empty() {
            return Ok(report);
        }

        // All seats of the batch, locked up front in ascending id order per event.
        let mut wanted: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for booking in &expired {
            wanted
                .entry(booking.event_id)
                .or_default()
                .extend(booking.seat_ids.iter().copied());
        }
        let mut locked: HashMap<i64, Seat> = HashMap::new();
        for (event_id, seat_ids) in wanted {
            let seat_ids: Vec<i64> = seat_ids.into_iter().collect();
            for seat in tx.lock_seats(event_id, &seat_ids).await? {
                locked.insert(seat.id, seat);
            }
        }

        for booking in expired {
            tx.set_booking_status(booking.id, BookingStatus::Failed, now).await?;

            // A seat that already went to BOOKED stays BOOKED.
            let releasable: Vec<i64> = booking
                .seat_ids
                .iter()
                .filter_map(|id| locked.get(id))
                .filter(|seat| seat.is_held_by(booking.id))
                .map(|seat| seat.id)
                .collect();
            if !releasable.is_empty() {
                tx.set_seat_status(&releasable, SeatStatus::Available, None).await?;
            }
            if releasable.len() < booking.seat_ids.len() {
                debug!(
                    "🧹 Booking {}: {} of {} seats were not reserved by it, left as is",
                    booking.id,
                    booking.seat_ids.len() - releasable.len(),
                    booking.seat_ids.len()
                );
            }

            report.expired += 1;
            report.released_seats += releasable.len() as u64;
            report.events.insert(booking.event_id);
        }

        Ok(report)
    }

    fn sweep_error(err: StoreError) -> BookingError {
        match err {
            StoreError::Serialization => {
                warn!("🧹 Sweep lost a serialization race, next run will pick it up");
                BookingError::Transient(StoreError::Serialization)
            }
            other => {
                error!("🧹 Sweep failed: {:?}", other);
                BookingError::from(other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Event;
    use crate::services::booking::{BookingCoordinator, BookingRequest, BookingSettings};
    use crate::store::MemoryStore;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    async fn setup(seat_count: i32, batch_size: i64) -> (MemoryStore, BookingCoordinator, ExpiryReactor, Event) {
        let store = MemoryStore::new(StdDuration::from_millis(500));
        let event = store.create_event("Late show", seat_count).await.unwrap();
        let shared: Arc<dyn SeatStore> = Arc::new(store.clone());
        let coordinator = BookingCoordinator::new(shared.clone(), BookingSettings::default());
        let reactor = ExpiryReactor::new(shared, batch_size);
        (store, coordinator, reactor, event)
    }

    fn request(event_id: i64, seat_ids: &[i64]) -> BookingRequest {
        BookingRequest { event_id, seat_ids: seat_ids.to_vec(), contact: None }
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + Duration::minutes(10)
    }

    #[tokio::test]
    async fn empty_ledger_is_a_no_op() {
        let (_, _, reactor, _) = setup(3, 100).await;
        assert_eq!(reactor.run_expiry_sweep().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn expired_hold_fails_and_frees_seats() {
        let (store, coordinator, reactor, event) = setup(5, 100).await;
        let hold = coordinator.place_hold(request(event.id, &[1, 2])).await.unwrap();

        // Still inside the window.
        assert_eq!(reactor.run_expiry_sweep().await.unwrap().expired, 0);

        let report = reactor.sweep_at(later()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.released_seats, 2);
        assert_eq!(report.events, BTreeSet::from([event.id]));

        let booking = store.find_booking(hold.id).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Failed);
        assert!(booking.expires_at.is_none());
        assert!(store.seats_for_event(event.id).await.unwrap().iter().all(Seat::is_available));

        // Freed seats can be booked again.
        coordinator.attempt_booking(request(event.id, &[1, 2])).await.unwrap();
    }

    #[tokio::test]
    async fn second_sweep_finds_nothing() {
        let (_, coordinator, reactor, event) = setup(5, 100).await;
        coordinator.place_hold(request(event.id, &[3])).await.unwrap();
        coordinator.place_hold(request(event.id, &[4, 5])).await.unwrap();

        let at = later();
        assert_eq!(reactor.sweep_at(at).await.unwrap().expired, 2);
        assert_eq!(reactor.sweep_at(at).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn confirmed_booking_is_never_touched() {
        let (store, coordinator, reactor, event) = setup(3, 100).await;
        let confirmation = coordinator.attempt_booking(request(event.id, &[1, 2, 3])).await.unwrap();

        assert_eq!(reactor.sweep_at(later()).await.unwrap().expired, 0);

        let seats = store.seats_for_event(event.id).await.unwrap();
        assert!(seats.iter().all(|s| s.status == SeatStatus::Booked));
        let booking = store.find_booking(confirmation.booking_id).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn confirmed_hold_survives_sweep_and_late_confirm_conflicts() {
        let (store, coordinator, reactor, event) = setup(4, 100).await;
        let kept = coordinator.place_hold(request(event.id, &[1, 2])).await.unwrap();
        let lapsed = coordinator.place_hold(request(event.id, &[3, 4])).await.unwrap();
        coordinator.confirm_hold(kept.id).await.unwrap();

        let report = reactor.sweep_at(later()).await.unwrap();
        assert_eq!(report.expired, 1);

        let seats = store.seats_for_event(event.id).await.unwrap();
        assert_eq!(
            seats.iter().map(|s| s.status).collect::<Vec<_>>(),
            vec![SeatStatus::Booked, SeatStatus::Booked, SeatStatus::Available, SeatStatus::Available]
        );

        match coordinator.confirm_hold(lapsed.id).await {
            Err(BookingError::Conflict { unavailable_seats }) => assert_eq!(unavailable_seats, vec![3, 4]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_size_bounds_each_sweep() {
        let (_, coordinator, reactor, event) = setup(3, 2).await;
        for seat in 1..=3 {
            coordinator.place_hold(request(event.id, &[seat])).await.unwrap();
        }

        let at = later();
        assert_eq!(reactor.sweep_at(at).await.unwrap().expired, 2);
        assert_eq!(reactor.sweep_at(at).await.unwrap().expired, 1);
        assert_eq!(reactor.sweep_at(at).await.unwrap().expired, 0);
    }

    #[tokio::test]
    async fn overlapping_sweeps_expire_each_hold_once() {
        let (store, coordinator, reactor, event) = setup(10, 100).await;
        for seat in 1..=10 {
            coordinator.place_hold(request(event.id, &[seat])).await.unwrap();
        }

        let reactor = Arc::new(reactor);
        let at = later();
        let sweeps: Vec<_> = (0..4)
            .map(|_| {
                let reactor = reactor.clone();
                tokio::spawn(async move { reactor.sweep_at(at).await })
            })
            .collect();

        let mut total = 0;
        for sweep in sweeps {
            total += sweep.await.unwrap().unwrap().expired;
        }
        assert_eq!(total, 10);
        assert!(store.seats_for_event(event.id).await.unwrap().iter().all(Seat::is_available));
    }

    #[tokio::test]
    async fn sweep_takes_seat_locks_in_ascending_order() {
        let (store, coordinator, reactor, event) = setup(5, 100).await;
        // Lower booking id on the higher seat.
        coordinator.place_hold(request(event.id, &[5])).await.unwrap();
        coordinator.place_hold(request(event.id, &[2])).await.unwrap();

        let mut other = store.begin().await.unwrap();
        other.lock_seats(event.id, &[2]).await.unwrap();

        let reactor = Arc::new(reactor);
        let at = later();
        let sweep = {
            let reactor = reactor.clone();
            tokio::spawn(async move { reactor.sweep_at(at).await })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        // The sweep is parked on seat 2 and must not be sitting on seat 5.
        let seat_five = tokio::time::timeout(StdDuration::from_millis(200), other.lock_seats(event.id, &[5]))
            .await
            .expect("seat 5 should be free while the sweep waits on seat 2")
            .unwrap();
        assert_eq!(seat_five.len(), 1);
        other.rollback().await.unwrap();

        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(report.released_seats, 2);
        assert!(store.seats_for_event(event.id).await.unwrap().iter().all(Seat::is_available));
    }

    #[tokio::test]
    async fn serialization_failure_is_transient_and_keeps_holds() {
        let (store, coordinator, reactor, event) = setup(3, 100).await;
        let hold = coordinator.place_hold(request(event.id, &[1])).await.unwrap();
        store.fail_next_commit(StoreError::Serialization).await;

        let err = reactor.sweep_at(later()).await.unwrap_err();
        assert!(matches!(err, BookingError::Transient(StoreError::Serialization)), "got {err:?}");
        assert!(err.is_retryable());

        let booking = store.find_booking(hold.id).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(reactor.sweep_at(later()).await.unwrap().expired, 1);
    }
}
