//! Shared fixtures for unit and integration tests.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::api::NewRide;
use crate::config::Config;
use crate::engine::Engine;
use crate::entities::{Location, Preferences, Ride, RideRequest, RideStatus, Vehicle};
use crate::geo::{GeoPoint, Route};
use crate::store::MemoryStore;

pub fn test_vehicle() -> Vehicle {
    Vehicle {
        model: "Golf".into(),
        color: "grey".into(),
        license_plate: "B-AB 1234".into(),
    }
}

/// A ride from Alexanderplatz to Potsdamer Platz with `seats` free seats.
pub fn make_ride(seats: u32) -> Ride {
    make_ride_between(
        GeoPoint::new(52.5219, 13.4132),
        GeoPoint::new(52.5096, 13.3759),
        seats,
    )
}

pub fn make_ride_between(start: GeoPoint, end: GeoPoint, seats: u32) -> Ride {
    let route = Route::from_points(vec![start, end]);
    let estimated_distance = route.length();
    let now = Utc::now();

    Ride {
        id: Uuid::new_v4(),
        driver_id: "driver-1".into(),
        start: Location::new("Start St", start),
        end: Location::new("End Ave", end),
        bounding_box: route.bounding_box(),
        planned_route: route,
        departure_time: now + Duration::hours(3),
        total_seats: seats,
        available_seats: seats,
        price_per_seat: 20.0,
        vehicle: test_vehicle(),
        preferences: Preferences::default(),
        estimated_distance,
        estimated_duration: estimated_distance / 1000.0 * 2.0,
        actual_distance: None,
        actual_duration: None,
        actual_start_time: None,
        actual_end_time: None,
        current_location: None,
        last_location_update: None,
        status: RideStatus::Pending,
        created_at: now,
        updated_at: now,
    }
}

pub fn make_request(ride_id: Uuid, seats: u32) -> RideRequest {
    RideRequest::new(ride_id, "passenger-1", seats)
}

/// Ride offer input for the engine's create path.
pub fn new_ride(driver_id: &str, start: GeoPoint, end: GeoPoint, seats: u32) -> NewRide {
    NewRide {
        driver_id: driver_id.into(),
        start: Location::new("Start St", start),
        end: Location::new("End Ave", end),
        waypoints: vec![],
        departure_time: Utc::now() + Duration::hours(3),
        seats,
        price_per_seat: 20.0,
        vehicle: test_vehicle(),
        preferences: Preferences::default(),
        estimated_distance: None,
        estimated_duration: None,
    }
}

pub fn engine() -> Engine<MemoryStore> {
    Engine::new(MemoryStore::new(), Config::default())
}
