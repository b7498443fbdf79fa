use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::UnknownStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Failed,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "FAILED" => Ok(BookingStatus::Failed),
            other => Err(UnknownStatus { kind: "booking", value: other.to_string() }),
        }
    }
}

/// Ledger entry for one booking attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    #[serde(rename = "bookingId")]
    pub id: i64,
    pub event_id: i64,
    /// Ascending, duplicate-free seat identities.
    pub seat_ids: Vec<i64>,
    pub contact: Option<String>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Only set while the booking is PENDING.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Pending
            && self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

/// A ledger row about to be inserted; always starts out PENDING.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub event_id: i64,
    pub seat_ids: Vec<i64>,
    pub contact: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
