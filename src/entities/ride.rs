use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Location;
use crate::error::{conflict_error, invalid_state_error, Error};
use crate::geo::{self, BoundingBox, GeoPoint, Route};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vehicle {
    pub model: String,
    pub color: String,
    pub license_plate: String,
}

/// Amenity flags a driver declares for the trip.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Preferences {
    pub allow_luggage: bool,
    pub allow_pets: bool,
    pub allow_smoking: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// One driver's offered trip.
///
/// Seat accounting invariant: `available_seats` never exceeds `total_seats`
/// (the count declared at creation) and never goes negative; every change
/// goes through `reserve_seats`/`release_seats` inside the store's atomic
/// transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub driver_id: String,
    pub start: Location,
    pub end: Location,
    pub planned_route: Route,
    pub bounding_box: Option<BoundingBox>,
    pub departure_time: DateTime<Utc>,
    pub total_seats: u32,
    pub available_seats: u32,
    pub price_per_seat: f64,
    pub vehicle: Vehicle,
    pub preferences: Preferences,
    /// Planned trip length in meters.
    pub estimated_distance: f64,
    /// Planned trip duration in minutes.
    pub estimated_duration: f64,
    pub actual_distance: Option<f64>,
    pub actual_duration: Option<f64>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub current_location: Option<GeoPoint>,
    pub last_location_update: Option<DateTime<Utc>>,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    pub fn is_open(&self) -> bool {
        self.status == RideStatus::Pending
    }

    /// Driver starts the trip.
    pub fn start(&mut self) -> Result<(), Error> {
        match self.status {
            RideStatus::Pending => {
                self.status = RideStatus::Active;
                self.actual_start_time = Some(Utc::now());
                self.actual_distance = Some(0.0);
                self.touch();
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Driver finishes the trip.
    pub fn complete(&mut self) -> Result<(), Error> {
        match self.status {
            RideStatus::Active => {
                let now = Utc::now();
                self.status = RideStatus::Completed;
                self.actual_end_time = Some(now);
                self.actual_duration = self
                    .actual_start_time
                    .map(|started| (now - started).num_seconds() as f64 / 60.0);
                self.touch();
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Driver withdraws the offer or aborts an active trip.
    pub fn cancel(&mut self) -> Result<(), Error> {
        match self.status {
            RideStatus::Pending | RideStatus::Active => {
                self.status = RideStatus::Cancelled;
                self.touch();
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Dispatches a requested status transition onto the lifecycle methods.
    pub fn transition(&mut self, to: RideStatus) -> Result<(), Error> {
        match to {
            RideStatus::Active => self.start(),
            RideStatus::Completed => self.complete(),
            RideStatus::Cancelled => self.cancel(),
            RideStatus::Pending => Err(invalid_state_error()),
        }
    }

    /// Records a live position fix. Only legal while the trip is ACTIVE;
    /// distance travelled accumulates between consecutive fixes.
    pub fn update_location(&mut self, point: GeoPoint) -> Result<(), Error> {
        if self.status != RideStatus::Active {
            return Err(invalid_state_error());
        }

        if let Some(previous) = self.current_location {
            let leg = geo::distance(previous, point);
            self.actual_distance = Some(self.actual_distance.unwrap_or(0.0) + leg);
        }

        self.current_location = Some(point);
        self.last_location_update = Some(Utc::now());
        self.touch();

        Ok(())
    }

    /// Takes `n` seats out of the pool; fails with a conflict when fewer
    /// than `n` remain. Returns the remaining seat count.
    pub fn reserve_seats(&mut self, n: u32) -> Result<u32, Error> {
        if n > self.available_seats {
            return Err(conflict_error(format!(
                "{} seats requested but only {} available",
                n, self.available_seats
            )));
        }

        self.available_seats -= n;
        self.touch();

        Ok(self.available_seats)
    }

    /// Returns `n` seats to the pool, saturating at the declared total.
    pub fn release_seats(&mut self, n: u32) -> u32 {
        self.available_seats = (self.available_seats + n).min(self.total_seats);
        self.touch();

        self.available_seats
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_ride;

    #[test]
    fn lifecycle_happy_path() {
        let mut ride = make_ride(3);

        assert!(ride.is_open());
        ride.start().unwrap();
        assert_eq!(ride.status, RideStatus::Active);
        assert!(ride.actual_start_time.is_some());

        ride.complete().unwrap();
        assert_eq!(ride.status, RideStatus::Completed);
        assert!(ride.actual_end_time.is_some());
        assert!(ride.actual_duration.is_some());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut ride = make_ride(3);

        assert!(ride.complete().unwrap_err().is_invalid_state());

        ride.cancel().unwrap();
        assert!(ride.start().unwrap_err().is_invalid_state());
        assert!(ride.cancel().unwrap_err().is_invalid_state());
    }

    #[test]
    fn transition_to_pending_is_never_legal() {
        let mut ride = make_ride(3);
        assert!(ride
            .transition(RideStatus::Pending)
            .unwrap_err()
            .is_invalid_state());
    }

    #[test]
    fn location_updates_require_active_trip() {
        let mut ride = make_ride(3);
        let fix = GeoPoint::new(52.52, 13.40);

        assert!(ride.update_location(fix).unwrap_err().is_invalid_state());

        ride.start().unwrap();
        ride.update_location(fix).unwrap();
        assert_eq!(ride.current_location, Some(fix));
    }

    #[test]
    fn location_updates_accumulate_distance() {
        let mut ride = make_ride(3);
        ride.start().unwrap();

        ride.update_location(GeoPoint::new(0.0, 0.0)).unwrap();
        ride.update_location(GeoPoint::new(0.0, 0.01)).unwrap();
        ride.update_location(GeoPoint::new(0.0, 0.02)).unwrap();

        let travelled = ride.actual_distance.unwrap();
        let expected = geo::distance(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 0.02));
        assert!((travelled - expected).abs() < 1.0, "got {}", travelled);
    }

    #[test]
    fn seat_accounting_bounds() {
        let mut ride = make_ride(3);

        assert_eq!(ride.reserve_seats(2).unwrap(), 1);
        assert!(ride.reserve_seats(2).unwrap_err().is_conflict());
        assert_eq!(ride.reserve_seats(1).unwrap(), 0);

        // Releases saturate at the declared total.
        assert_eq!(ride.release_seats(2), 2);
        assert_eq!(ride.release_seats(5), 3);
    }
}
