use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::runtime::Runtime;

use seat_booking::services::booking::normalize_seat_ids;
use seat_booking::services::{BookingCoordinator, BookingRequest, BookingSettings, ExpiryReactor};
use seat_booking::store::{MemoryStore, SeatStore};

fn bench_normalize(c: &mut Criterion) {
    let ids = vec![9, 3, 3, 7, 1, 10, 2, 2, 8, 4];
    c.bench_function("normalize_seat_ids", |b| b.iter(|| normalize_seat_ids(black_box(&ids))));
}

fn bench_booking(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = MemoryStore::new(StdDuration::from_secs(1));
    let event = rt.block_on(store.create_event("bench", 20)).unwrap();
    let shared: Arc<dyn SeatStore> = Arc::new(store);
    let coordinator = BookingCoordinator::new(shared.clone(), BookingSettings::default());
    let reactor = ExpiryReactor::new(shared, 100);

    let request = |seat_ids: Vec<i64>| BookingRequest { event_id: event.id, seat_ids, contact: None };

    // Seats 1..=5 are booked once; every later attempt takes the conflict path.
    rt.block_on(coordinator.attempt_booking(request(vec![1, 2, 3, 4, 5]))).unwrap();
    c.bench_function("attempt_booking_conflict", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = coordinator.attempt_booking(request(vec![3, 4])).await;
        })
    });

    // Hold then expire, leaving seats 11..=14 free for the next iteration.
    let later = Utc::now() + Duration::days(1);
    c.bench_function("hold_and_expire", |b| {
        b.to_async(&rt).iter(|| async {
            coordinator.place_hold(request(vec![11, 12, 13, 14])).await.unwrap();
            reactor.sweep_at(later).await.unwrap();
        })
    });
}

// Eight callers race for the same three seats of a fresh event.
fn bench_contention(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = MemoryStore::new(StdDuration::from_secs(5));
    let coordinator = Arc::new(BookingCoordinator::new(Arc::new(store.clone()), BookingSettings::default()));

    c.bench_function("contended_booking_8_callers", |b| {
        b.to_async(&rt).iter(|| async {
            let event = store.create_event("race", 3).await.unwrap();
            let seat_ids: Vec<i64> = store.seats_for_event(event.id).await.unwrap().iter().map(|s| s.id).collect();
            let attempts = (0..8).map(|_| {
                let coordinator = coordinator.clone();
                let request = BookingRequest { event_id: event.id, seat_ids: seat_ids.clone(), contact: None };
                tokio::spawn(async move { coordinator.attempt_booking(request).await })
            });
            let won = join_all(attempts).await.into_iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
            assert_eq!(won, 1);
        })
    });
}

criterion_group!(benches, bench_normalize, bench_booking, bench_contention);
criterion_main!(benches);
