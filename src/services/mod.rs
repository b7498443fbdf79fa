pub mod booking;
pub mod expiry;

pub use booking::{BookingConfirmation, BookingCoordinator, BookingRequest, BookingSettings};
pub use expiry::{ExpiryReactor, SweepReport};
