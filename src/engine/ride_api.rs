use super::{paginate, Engine};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::api::{HistoryQuery, HistoryRole, HistorySort, NewRide, Page, RideAPI};
use crate::entities::{Ride, RideStatus};
use crate::error::{validation_error, Error};
use crate::geo::{GeoPoint, Route};
use crate::store::Store;

#[async_trait]
impl<S: Store> RideAPI for Engine<S> {
    #[tracing::instrument(skip(self))]
    async fn create_ride(&self, new_ride: NewRide) -> Result<Ride, Error> {
        if new_ride.driver_id.trim().is_empty() {
            return Err(validation_error("driver id must not be empty"));
        }

        new_ride.start.validate()?;
        new_ride.end.validate()?;

        if new_ride.seats == 0 {
            return Err(validation_error("a ride needs at least one seat"));
        }

        if new_ride.price_per_seat < 0.0 {
            return Err(validation_error("price per seat must not be negative"));
        }

        for waypoint in &new_ride.waypoints {
            if !waypoint.point.is_valid() {
                return Err(validation_error("invalid waypoint coordinates"));
            }
        }

        // Planned route: supplied waypoints in order, with the ride's own
        // endpoints ensured at both ends.
        let mut points: Vec<GeoPoint> =
            Route::from_waypoints(new_ride.waypoints)?.points().to_vec();

        if points.first() != Some(&new_ride.start.point) {
            points.insert(0, new_ride.start.point);
        }
        if points.last() != Some(&new_ride.end.point) {
            points.push(new_ride.end.point);
        }

        let planned_route = Route::from_points(points);
        let bounding_box = planned_route.bounding_box();

        let estimated_distance = new_ride
            .estimated_distance
            .unwrap_or_else(|| planned_route.length());
        let estimated_duration = new_ride
            .estimated_duration
            .unwrap_or(estimated_distance / 1000.0 * 2.0);

        let now = Utc::now();
        let ride = Ride {
            id: Uuid::new_v4(),
            driver_id: new_ride.driver_id,
            start: new_ride.start,
            end: new_ride.end,
            planned_route,
            bounding_box,
            departure_time: new_ride.departure_time,
            total_seats: new_ride.seats,
            available_seats: new_ride.seats,
            price_per_seat: new_ride.price_per_seat,
            vehicle: new_ride.vehicle,
            preferences: new_ride.preferences,
            estimated_distance,
            estimated_duration,
            actual_distance: None,
            actual_duration: None,
            actual_start_time: None,
            actual_end_time: None,
            current_location: None,
            last_location_update: None,
            status: RideStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_ride(&ride).await?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn find_ride(&self, id: Uuid) -> Result<Ride, Error> {
        self.store.fetch_ride(id).await
    }

    #[tracing::instrument(skip(self))]
    async fn update_ride_status(&self, id: Uuid, status: RideStatus) -> Result<Ride, Error> {
        self.store.update_ride_status(id, status).await
    }

    #[tracing::instrument(skip(self))]
    async fn update_ride_location(&self, id: Uuid, point: GeoPoint) -> Result<Ride, Error> {
        if !point.is_valid() {
            return Err(validation_error(format!(
                "invalid coordinates ({}, {})",
                point.latitude, point.longitude
            )));
        }

        self.store.update_ride_location(id, point).await
    }

    #[tracing::instrument(skip(self))]
    async fn ride_history(
        &self,
        user_id: &str,
        query: HistoryQuery,
    ) -> Result<Page<Ride>, Error> {
        if user_id.trim().is_empty() {
            return Err(validation_error("user id must not be empty"));
        }
        if query.page == 0 {
            return Err(validation_error("page is 1-based"));
        }
        if query.limit == 0 || query.limit > 100 {
            return Err(validation_error("limit must be between 1 and 100"));
        }

        let rides = match query.role {
            HistoryRole::Driver => self.store.rides_for_driver(user_id).await?,
            HistoryRole::Passenger => self.store.rides_for_passenger(user_id).await?,
        };

        let mut rides: Vec<Ride> = rides
            .into_iter()
            .filter(|ride| query.status.map_or(true, |wanted| ride.status == wanted))
            .filter(|ride| {
                let date = ride.departure_time.date_naive();
                query.date_from.map_or(true, |from| date >= from)
                    && query.date_to.map_or(true, |to| date <= to)
            })
            .collect();

        match query.sort_by {
            HistorySort::Date => rides.sort_by_key(|ride| ride.departure_time),
            HistorySort::Price => rides.sort_by(|a, b| {
                a.price_per_seat
                    .partial_cmp(&b.price_per_seat)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            HistorySort::Distance => rides.sort_by(|a, b| {
                a.estimated_distance
                    .partial_cmp(&b.estimated_distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        if query.descending {
            rides.reverse();
        }

        Ok(paginate(rides, query.page, query.limit))
    }
}
