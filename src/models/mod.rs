pub mod event;
pub mod seat;
pub mod booking;

pub use event::Event;
pub use seat::{Seat, SeatStatus};
pub use booking::{Booking, BookingStatus, NewBooking};

/// Raised when a status column holds a value outside its enum.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} status {value:?}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}
