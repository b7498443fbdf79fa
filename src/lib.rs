pub mod cache;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::cache::SeatCache;
use crate::config::{BookingConfig, Config, StoreBackend};
use crate::database::Database;
use crate::error::BookingError;
use crate::services::booking::BookingCoordinator;
use crate::services::expiry::{ExpiryReactor, SweepReport};
use crate::store::{MemoryStore, PgSeatStore, SeatStore};

// Shared state for the whole application
pub struct AppState {
    pub store: Arc<dyn SeatStore>,
    pub coordinator: BookingCoordinator,
    pub reactor: ExpiryReactor,
    pub cache: Option<SeatCache>,
}

impl AppState {
    pub fn new(store: Arc<dyn SeatStore>, cache: Option<SeatCache>, booking: &BookingConfig) -> Arc<Self> {
        Arc::new(Self {
            coordinator: BookingCoordinator::new(store.clone(), booking.settings()),
            reactor: ExpiryReactor::new(store.clone(), booking.sweep_batch_size),
            store,
            cache,
        })
    }

    /// Opens the configured store (running migrations on Postgres) and the
    /// optional seat map cache.
    pub async fn connect(config: &Config) -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn SeatStore> = match config.database.backend {
            StoreBackend::Postgres => {
                let db = Database::new(&config.database).await?;
                db.run_migrations().await?;
                info!("Database connected");
                Arc::new(PgSeatStore::new(db, config.database.lock_timeout()))
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; all state is lost on restart");
                Arc::new(MemoryStore::new(config.database.lock_timeout()))
            }
        };

        let cache = match &config.redis.url {
            Some(url) => match SeatCache::connect(url, config.redis.seat_cache_ttl_secs).await {
                Ok(cache) => {
                    info!("Redis connected, seat map cache enabled");
                    Some(cache)
                }
                Err(e) => {
                    warn!("Redis unavailable, seat map cache disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self::new(store, cache, &config.booking))
    }

    pub async fn invalidate_seats(&self, event_id: i64) {
        if let Some(cache) = &self.cache {
            cache.invalidate(event_id).await;
        }
    }

    /// Runs one sweep and drops cached seat maps of every event it touched.
    pub async fn run_expiry_sweep(&self) -> Result<SweepReport, BookingError> {
        let report = self.reactor.run_expiry_sweep().await?;
        for event_id in &report.events {
            self.invalidate_seats(*event_id).await;
        }
        Ok(report)
    }

    /// Background sweep loop. Failures are logged and the loop keeps going.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let state = self.clone();
        task::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Expiry sweeper running every {:?}", every);
            loop {
                ticker.tick().await;
                if let Err(e) = state.run_expiry_sweep().await {
                    error!("Expiry sweep failed: {}", e);
                }
            }
        })
    }
}
