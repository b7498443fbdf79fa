use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::booking::BookingSettings;

// Top-level configuration, one section per concern
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub booking: BookingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format {other:?}, expected pretty or json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("unknown store backend {other:?}, expected postgres or memory"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    /// Empty when running on the in-memory store.
    pub url: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
    /// Upper bound on waiting for a seat or ledger row lock.
    pub lock_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// Seat map cache; disabled when REDIS_URL is unset
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub seat_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    pub reservation_window_secs: i64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
}

impl BookingConfig {
    pub fn settings(&self) -> BookingSettings {
        BookingSettings {
            reservation_window: chrono::Duration::seconds(self.reservation_window_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source; `from_env` passes
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let backend: StoreBackend = vars.parse_or("STORE_BACKEND", StoreBackend::Postgres)?;
        let url = match (backend, vars.get("DATABASE_URL")) {
            (_, Some(url)) => url,
            (StoreBackend::Memory, None) => String::new(),
            (StoreBackend::Postgres, None) => bail!("DATABASE_URL must be set"),
        };

        let config = Config {
            app: AppConfig {
                host: vars.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: vars.parse_or("PORT", 8000)?,
                environment: vars.get("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
                rust_log: vars
                    .get("RUST_LOG")
                    .unwrap_or_else(|| "seat_booking=debug,tower_http=debug".to_string()),
                log_format: vars.parse_or("LOG_FORMAT", LogFormat::Pretty)?,
            },
            database: DatabaseConfig {
                backend,
                url,
                pool_size: vars.parse_or("DB_POOL_SIZE", 20)?,
                acquire_timeout_secs: vars.parse_or("DB_ACQUIRE_TIMEOUT_SECS", 5)?,
                lock_timeout_ms: vars.parse_or("DB_LOCK_TIMEOUT_MS", 5000)?,
            },
            redis: RedisConfig {
                url: vars.get("REDIS_URL").filter(|url| !url.is_empty()),
                seat_cache_ttl_secs: vars.parse_or("SEAT_CACHE_TTL_SECS", 5)?,
            },
            booking: BookingConfig {
                reservation_window_secs: vars.parse_or("RESERVATION_WINDOW_SECS", 120)?,
                sweep_interval_secs: vars.parse_or("SWEEP_INTERVAL_SECS", 60)?,
                sweep_batch_size: vars.parse_or("SWEEP_BATCH_SIZE", 500)?,
            },
        };

        if config.booking.reservation_window_secs <= 0 {
            bail!("RESERVATION_WINDOW_SECS must be positive");
        }
        if config.booking.sweep_interval_secs == 0 {
            bail!("SWEEP_INTERVAL_SECS must be positive");
        }
        if config.booking.sweep_batch_size <= 0 {
            bail!("SWEEP_BATCH_SIZE must be positive");
        }
        Ok(config)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse_or<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("{key} has an invalid value {raw:?}")),
        }
    }
}
