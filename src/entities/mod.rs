mod location;
mod request;
mod ride;

pub use location::Location;
pub use request::{RequestStatus, RideRequest};
pub use ride::{Preferences, Ride, RideStatus, Vehicle};
