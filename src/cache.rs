use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, warn};

use crate::models::Seat;

/// Redis copy of per-event seat maps for the read path.
///
/// Every failure here is logged and swallowed: callers fall back to the
/// store, and booking decisions never read from the cache.
#[derive(Clone)]
pub struct SeatCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl SeatCache {
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn, ttl_secs })
    }

    fn key(event_id: i64) -> String {
        format!("seats:{}", event_id)
    }

    pub async fn get_seats(&self, event_id: i64) -> Option<Vec<Seat>> {
        let mut conn = self.conn.clone();
        let cached: redis::RedisResult<Option<String>> = conn.get(Self::key(event_id)).await;

        match cached {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(seats) => Some(seats),
                Err(e) => {
                    warn!("Dropping unreadable seat cache for event {}: {}", event_id, e);
                    self.invalidate(event_id).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Seat cache read failed for event {}: {}", event_id, e);
                None
            }
        }
    }

    pub async fn put_seats(&self, event_id: i64, seats: &[Seat]) {
        let json = match serde_json::to_string(seats) {
            Ok(json) => json,
            Err(e) => {
                warn!("Could not serialize seats of event {}: {}", event_id, e);
                return;
            }
        };

        let mut conn = self.conn.clone();
        let stored: redis::RedisResult<()> = conn.set_ex(Self::key(event_id), json, self.ttl_secs).await;
        if let Err(e) = stored {
            warn!("Seat cache write failed for event {}: {}", event_id, e);
        }
    }

    pub async fn invalidate(&self, event_id: i64) {
        let mut conn = self.conn.clone();
        let removed: redis::RedisResult<()> = conn.del(Self::key(event_id)).await;
        match removed {
            Ok(()) => debug!("Invalidated seats cache for event {}", event_id),
            Err(e) => warn!("Seat cache invalidation failed for event {}: {}", event_id, e),
        }
    }
}
