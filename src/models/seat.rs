use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::UnknownStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Reserved,
    Booked,
}

impl SeatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeatStatus::Available => "AVAILABLE",
            SeatStatus::Reserved => "RESERVED",
            SeatStatus::Booked => "BOOKED",
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(SeatStatus::Available),
            "RESERVED" => Ok(SeatStatus::Reserved),
            "BOOKED" => Ok(SeatStatus::Booked),
            other => Err(UnknownStatus { kind: "seat", value: other.to_string() }),
        }
    }
}

/// One numbered seat of an event, as last committed (or as seen inside the
/// transaction that holds its lock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    pub id: i64,
    pub event_id: i64,
    pub seat_number: i32,
    pub status: SeatStatus,
    /// Booking currently holding the seat; `None` while available.
    pub booking_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Seat {
    pub fn is_available(&self) -> bool {
        self.status == SeatStatus::Available
    }

    /// True when the seat is still RESERVED on behalf of `booking_id`.
    pub fn is_held_by(&self, booking_id: i64) -> bool {
        self.status == SeatStatus::Reserved && self.booking_id == Some(booking_id)
    }
}
