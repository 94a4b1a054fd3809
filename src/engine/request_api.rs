use super::{round2, Engine};

use async_trait::async_trait;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::api::{NearbyRequest, NewRequest, OptimalStops, RequestAPI};
use crate::entities::{RequestStatus, Ride, RideRequest};
use crate::error::{excessive_detour_error, validation_error, Error};
use crate::geo::{self, GeoPoint, Route};
use crate::store::{RequestEvent, Store};

/// Detour the ride's driver takes on for a request's custom stops, against
/// the ride's original start-to-end estimate.
fn detour_for(ride: &Ride, pickup: GeoPoint, dropoff: GeoPoint) -> (f64, f64, f64, f64) {
    let pickup_distance = geo::distance(ride.start.point, pickup).round();
    let dropoff_distance = geo::distance(dropoff, ride.end.point).round();

    let new_route_length = Route::from_points(vec![
        ride.start.point,
        pickup,
        dropoff,
        ride.end.point,
    ])
    .length()
    .round();

    let additional_distance = (new_route_length - ride.estimated_distance).max(0.0);
    let detour_percentage = if ride.estimated_distance > 0.0 {
        round2(additional_distance / ride.estimated_distance * 100.0)
    } else {
        0.0
    };

    (
        pickup_distance,
        dropoff_distance,
        additional_distance,
        detour_percentage,
    )
}

#[async_trait]
impl<S: Store> RequestAPI for Engine<S> {
    #[tracing::instrument(skip(self))]
    async fn create_request(&self, new_request: NewRequest) -> Result<RideRequest, Error> {
        // Validation happens before any store access; a rejected request
        // leaves no trace.
        if new_request.passenger_id.trim().is_empty() {
            return Err(validation_error("passenger id must not be empty"));
        }
        if new_request.seats_needed == 0 || new_request.seats_needed > 8 {
            return Err(validation_error("seats needed must be between 1 and 8"));
        }
        if new_request
            .message
            .as_ref()
            .is_some_and(|message| message.chars().count() > 500)
        {
            return Err(validation_error("message must not exceed 500 characters"));
        }
        if let Some(pickup) = &new_request.pickup {
            pickup.validate()?;
        }
        if let Some(dropoff) = &new_request.dropoff {
            dropoff.validate()?;
        }
        if new_request
            .max_detour_percentage
            .is_some_and(|limit| limit < 0.0)
        {
            return Err(validation_error("max detour must not be negative"));
        }

        let ride = self.store.fetch_ride(new_request.ride_id).await?;

        let mut request = RideRequest::new(
            new_request.ride_id,
            new_request.passenger_id,
            new_request.seats_needed,
        );
        request.message = new_request.message;

        if let (Some(pickup), Some(dropoff)) = (&new_request.pickup, &new_request.dropoff) {
            let (pickup_distance, dropoff_distance, additional_distance, detour_percentage) =
                detour_for(&ride, pickup.point, dropoff.point);

            let limit = new_request
                .max_detour_percentage
                .or_else(|| self.policy.max_detour_percentage());
            if let Some(limit) = limit {
                if detour_percentage > limit {
                    return Err(excessive_detour_error(detour_percentage, limit));
                }
            }

            request.pickup_distance = pickup_distance;
            request.dropoff_distance = dropoff_distance;
            request.additional_distance = additional_distance;
            request.detour_percentage = detour_percentage;
        }

        request.requested_pickup = new_request.pickup;
        request.requested_dropoff = new_request.dropoff;

        self.store.insert_request(&request).await?;

        Ok(request)
    }

    #[tracing::instrument(skip(self))]
    async fn find_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        self.store.fetch_request(id).await
    }

    #[tracing::instrument(skip(self))]
    async fn requests_by_ride(&self, ride_id: Uuid) -> Result<Vec<RideRequest>, Error> {
        self.store.requests_by_ride(ride_id).await
    }

    #[tracing::instrument(skip(self))]
    async fn requests_by_passenger(
        &self,
        passenger_id: &str,
        status: Option<RequestStatus>,
    ) -> Result<Vec<RideRequest>, Error> {
        if passenger_id.trim().is_empty() {
            return Err(validation_error("passenger id must not be empty"));
        }

        self.store.requests_by_passenger(passenger_id, status).await
    }

    #[tracing::instrument(skip(self))]
    async fn pending_requests_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<RideRequest>, Error> {
        if driver_id.trim().is_empty() {
            return Err(validation_error("driver id must not be empty"));
        }

        self.store.pending_requests_for_driver(driver_id).await
    }

    #[tracing::instrument(skip(self))]
    async fn accept_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        let outcome = self
            .store
            .transition_request(
                id,
                RequestEvent::Accept {
                    reject_pending_when_full: self.policy.reject_pending_when_full(),
                },
            )
            .await?;

        if !outcome.auto_rejected.is_empty() {
            tracing::info!(
                ride_id = %outcome.request.ride_id,
                rejected = outcome.auto_rejected.len(),
                "ride is full, remaining pending requests rejected"
            );
        }

        Ok(outcome.request)
    }

    #[tracing::instrument(skip(self))]
    async fn reject_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        let outcome = self
            .store
            .transition_request(id, RequestEvent::Reject)
            .await?;

        Ok(outcome.request)
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        let outcome = self
            .store
            .transition_request(id, RequestEvent::Cancel)
            .await?;

        if let Some(remaining) = outcome.remaining_seats {
            tracing::info!(
                ride_id = %outcome.request.ride_id,
                remaining,
                "seats returned to ride"
            );
        }

        Ok(outcome.request)
    }

    #[tracing::instrument(skip(self))]
    async fn pickup_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        let outcome = self
            .store
            .transition_request(id, RequestEvent::Pickup)
            .await?;

        Ok(outcome.request)
    }

    #[tracing::instrument(skip(self))]
    async fn dropoff_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        let outcome = self
            .store
            .transition_request(id, RequestEvent::Dropoff)
            .await?;

        Ok(outcome.request)
    }

    #[tracing::instrument(skip(self))]
    async fn find_optimal_stops(
        &self,
        ride_id: Uuid,
        passenger_start: GeoPoint,
        passenger_end: GeoPoint,
        max_detour_km: Option<f64>,
    ) -> Result<Option<OptimalStops>, Error> {
        if !passenger_start.is_valid() || !passenger_end.is_valid() {
            return Err(validation_error("invalid passenger coordinates"));
        }

        let budget_km = max_detour_km.unwrap_or(self.config.default_max_detour_km);
        if budget_km <= 0.0 {
            return Err(validation_error("detour budget must be positive"));
        }

        let ride = self.store.fetch_ride(ride_id).await?;

        let pickup =
            geo::nearest_point_on_segment(passenger_start, ride.start.point, ride.end.point);
        let dropoff =
            geo::nearest_point_on_segment(passenger_end, ride.start.point, ride.end.point);

        let walk_to_pickup = geo::distance(passenger_start, pickup).round();
        let walk_from_dropoff = geo::distance(passenger_end, dropoff).round();
        let total_detour_km = (walk_to_pickup + walk_from_dropoff) / 1000.0;

        // An unwalkable detour is an expected negative outcome, not an error.
        if total_detour_km > budget_km {
            tracing::info!(
                ride_id = %ride_id,
                total_detour_km,
                budget_km,
                "walking detour exceeds budget, no match"
            );
            return Ok(None);
        }

        Ok(Some(OptimalStops {
            pickup,
            dropoff,
            walk_to_pickup,
            walk_from_dropoff,
            ride_segment_distance: geo::distance(pickup, dropoff).round(),
            total_detour_km: round2(total_detour_km),
        }))
    }

    #[tracing::instrument(skip(self))]
    async fn requests_near(
        &self,
        center: GeoPoint,
        radius: f64,
    ) -> Result<Vec<NearbyRequest>, Error> {
        if !center.is_valid() {
            return Err(validation_error("invalid center coordinates"));
        }
        if radius <= 0.0 || radius > 50_000.0 {
            return Err(validation_error("radius must be between 1 and 50000 meters"));
        }

        let requests = self.store.pending_requests_near(center, radius).await?;

        let mut nearby: Vec<NearbyRequest> = requests
            .into_iter()
            .filter_map(|request| {
                let pickup = request.requested_pickup.as_ref()?.point;
                Some(NearbyRequest {
                    distance_from_center: geo::distance(pickup, center),
                    request,
                })
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_from_center
                .partial_cmp(&b.distance_from_center)
                .unwrap_or(Ordering::Equal)
        });

        Ok(nearby)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::api::{NewRequest, RequestAPI, RideAPI};
    use crate::entities::{Location, RequestStatus};
    use crate::geo::GeoPoint;
    use crate::test_helpers::{engine, new_ride};
    use uuid::Uuid;

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng)
    }

    fn start() -> GeoPoint {
        p(52.5200, 13.4050)
    }

    fn end() -> GeoPoint {
        p(52.4550, 13.5200)
    }

    #[tokio::test]
    async fn create_validates_before_touching_the_store() {
        let engine = engine();

        let bad_seats = NewRequest::new(Uuid::new_v4(), "passenger-1", 9);
        assert!(engine
            .create_request(bad_seats)
            .await
            .unwrap_err()
            .is_validation());

        let mut long_message = NewRequest::new(Uuid::new_v4(), "passenger-1", 1);
        long_message.message = Some("x".repeat(501));
        assert!(engine
            .create_request(long_message)
            .await
            .unwrap_err()
            .is_validation());

        // Valid input against a missing ride is NotFound, not validation.
        let missing_ride = NewRequest::new(Uuid::new_v4(), "passenger-1", 1);
        assert!(engine
            .create_request(missing_ride)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn detour_is_zero_when_stops_match_the_rides_own_endpoints() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 3))
            .await
            .unwrap();

        let mut request = NewRequest::new(ride.id, "passenger-1", 1);
        request.pickup = Some(Location::new("ride start", start()));
        request.dropoff = Some(Location::new("ride end", end()));

        let created = engine.create_request(request).await.unwrap();

        assert_eq!(created.status, RequestStatus::Pending);
        assert_eq!(created.pickup_distance, 0.0);
        assert_eq!(created.dropoff_distance, 0.0);
        assert_eq!(created.additional_distance, 0.0);
        assert_eq!(created.detour_percentage, 0.0);
    }

    #[tokio::test]
    async fn detour_fields_are_computed_and_persisted() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 3))
            .await
            .unwrap();

        // Stops a little off the direct path.
        let mut request = NewRequest::new(ride.id, "passenger-1", 1);
        request.pickup = Some(Location::new("side street", p(52.5300, 13.4100)));
        request.dropoff = Some(Location::new("other side", p(52.4500, 13.5100)));

        let created = engine.create_request(request).await.unwrap();

        assert!(created.pickup_distance > 0.0);
        assert!(created.dropoff_distance > 0.0);
        assert!(created.additional_distance > 0.0);
        assert!(created.detour_percentage > 0.0);

        let fetched = engine.find_request(created.id).await.unwrap();
        assert_eq!(fetched.detour_percentage, created.detour_percentage);
    }

    #[tokio::test]
    async fn excessive_detour_is_rejected_when_a_limit_applies() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 3))
            .await
            .unwrap();

        // A pickup far behind the ride start doubles the trip.
        let mut request = NewRequest::new(ride.id, "passenger-1", 1);
        request.pickup = Some(Location::new("way off", p(52.6500, 13.2000)));
        request.dropoff = Some(Location::new("ride end", end()));
        request.max_detour_percentage = Some(20.0);

        let err = engine.create_request(request).await.unwrap_err();
        assert!(err.is_excessive_detour());

        // Without a limit the same detour is recorded, not refused.
        let mut request = NewRequest::new(ride.id, "passenger-1", 1);
        request.pickup = Some(Location::new("way off", p(52.6500, 13.2000)));
        request.dropoff = Some(Location::new("ride end", end()));

        let created = engine.create_request(request).await.unwrap();
        assert!(created.detour_percentage > 20.0);
    }

    #[tokio::test]
    async fn accept_decrements_seats_and_cancel_restores_them() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 3))
            .await
            .unwrap();

        let request = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 2))
            .await
            .unwrap();

        engine.accept_request(request.id).await.unwrap();
        assert_eq!(engine.find_ride(ride.id).await.unwrap().available_seats, 1);

        let cancelled = engine.cancel_request(request.id).await.unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(engine.find_ride(ride.id).await.unwrap().available_seats, 3);
    }

    #[tokio::test]
    async fn cancelling_a_pending_request_returns_nothing() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 3))
            .await
            .unwrap();

        let request = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 2))
            .await
            .unwrap();

        engine.cancel_request(request.id).await.unwrap();
        assert_eq!(engine.find_ride(ride.id).await.unwrap().available_seats, 3);
    }

    #[tokio::test]
    async fn accept_beyond_capacity_is_a_conflict() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 1))
            .await
            .unwrap();

        let request = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 2))
            .await
            .unwrap();

        let err = engine.accept_request(request.id).await.unwrap_err();
        assert!(err.is_conflict());

        // Nothing changed: seats intact, request still pending.
        assert_eq!(engine.find_ride(ride.id).await.unwrap().available_seats, 1);
        assert_eq!(
            engine.find_request(request.id).await.unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn filling_the_ride_auto_rejects_other_pending_requests() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 2))
            .await
            .unwrap();

        let winner = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 2))
            .await
            .unwrap();
        let loser = engine
            .create_request(NewRequest::new(ride.id, "passenger-2", 1))
            .await
            .unwrap();

        engine.accept_request(winner.id).await.unwrap();

        assert_eq!(engine.find_ride(ride.id).await.unwrap().available_seats, 0);
        assert_eq!(
            engine.find_request(loser.id).await.unwrap().status,
            RequestStatus::Rejected
        );
    }

    #[tokio::test]
    async fn concurrent_accepts_never_oversell() {
        let engine = Arc::new(engine());
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 2))
            .await
            .unwrap();

        let a = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 2))
            .await
            .unwrap();
        let b = engine
            .create_request(NewRequest::new(ride.id, "passenger-2", 2))
            .await
            .unwrap();

        let engine_a = Arc::clone(&engine);
        let engine_b = Arc::clone(&engine);
        let task_a = tokio::spawn(async move { engine_a.accept_request(a.id).await });
        let task_b = tokio::spawn(async move { engine_b.accept_request(b.id).await });

        let result_a = task_a.await.unwrap();
        let result_b = task_b.await.unwrap();

        // Exactly one accept wins; the other sees a conflict (or was
        // auto-rejected by the winner's cascade and reports invalid state).
        let successes = [&result_a, &result_b]
            .iter()
            .filter(|result| result.is_ok())
            .count();
        assert_eq!(successes, 1);

        let failure = if result_a.is_ok() { result_b } else { result_a };
        let err = failure.unwrap_err();
        assert!(err.is_conflict() || err.is_invalid_state());

        assert_eq!(engine.find_ride(ride.id).await.unwrap().available_seats, 0);
    }

    #[tokio::test]
    async fn pickup_and_dropoff_complete_the_journey() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 2))
            .await
            .unwrap();

        let request = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 1))
            .await
            .unwrap();

        // Boarding before acceptance is refused.
        assert!(engine
            .pickup_request(request.id)
            .await
            .unwrap_err()
            .is_invalid_state());

        engine.accept_request(request.id).await.unwrap();

        let boarded = engine.pickup_request(request.id).await.unwrap();
        assert_eq!(boarded.status, RequestStatus::OnGoing);
        assert!(boarded.picked_up_at.is_some());

        let done = engine.dropoff_request(request.id).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert!(done.dropped_off_at.is_some());

        // Completion never returns seats.
        assert_eq!(engine.find_ride(ride.id).await.unwrap().available_seats, 1);
    }

    #[tokio::test]
    async fn solver_projects_stops_onto_the_ride_path() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", p(52.50, 13.30), p(52.50, 13.50), 2))
            .await
            .unwrap();

        // Passenger lives just off the path.
        let stops = engine
            .find_optimal_stops(ride.id, p(52.505, 13.35), p(52.495, 13.45), None)
            .await
            .unwrap()
            .unwrap();

        assert!(stops.walk_to_pickup > 0.0);
        assert!(stops.walk_from_dropoff > 0.0);
        assert!(stops.total_detour_km <= 2.0);
        assert!(stops.ride_segment_distance > 0.0);

        // Projections land on the ride's parallel.
        assert!((stops.pickup.latitude - 52.50).abs() < 1e-3);
        assert!((stops.dropoff.latitude - 52.50).abs() < 1e-3);
    }

    #[tokio::test]
    async fn solver_returns_none_when_walking_exceeds_the_budget() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", p(52.50, 13.30), p(52.50, 13.50), 2))
            .await
            .unwrap();

        // ~1.4 km walk on each side: 2.8 km total against a 2 km budget.
        let result = engine
            .find_optimal_stops(ride.id, p(52.5125, 13.35), p(52.4875, 13.45), Some(2.0))
            .await
            .unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn requests_near_orders_by_pickup_distance() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 4))
            .await
            .unwrap();

        let mut far = NewRequest::new(ride.id, "passenger-1", 1);
        far.pickup = Some(Location::new("far stop", p(52.5300, 13.4050)));
        far.dropoff = Some(Location::new("ride end", end()));
        let far = engine.create_request(far).await.unwrap();

        let mut near = NewRequest::new(ride.id, "passenger-2", 1);
        near.pickup = Some(Location::new("near stop", p(52.5210, 13.4050)));
        near.dropoff = Some(Location::new("ride end", end()));
        let near = engine.create_request(near).await.unwrap();

        // No pickup point: invisible to the area query.
        engine
            .create_request(NewRequest::new(ride.id, "passenger-3", 1))
            .await
            .unwrap();

        let nearby = engine.requests_near(start(), 5000.0).await.unwrap();

        assert_eq!(nearby.len(), 2);
        assert_eq!(nearby[0].request.id, near.id);
        assert_eq!(nearby[1].request.id, far.id);
        assert!(nearby[0].distance_from_center < nearby[1].distance_from_center);
    }

    #[tokio::test]
    async fn listings_by_passenger_and_driver() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), 4))
            .await
            .unwrap();
        let other_ride = engine
            .create_ride(new_ride("driver-2", start(), end(), 4))
            .await
            .unwrap();

        let mine = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 1))
            .await
            .unwrap();
        engine
            .create_request(NewRequest::new(other_ride.id, "passenger-1", 1))
            .await
            .unwrap();
        engine
            .create_request(NewRequest::new(ride.id, "passenger-2", 1))
            .await
            .unwrap();

        let by_passenger = engine
            .requests_by_passenger("passenger-1", None)
            .await
            .unwrap();
        assert_eq!(by_passenger.len(), 2);

        engine.accept_request(mine.id).await.unwrap();
        let accepted_only = engine
            .requests_by_passenger("passenger-1", Some(RequestStatus::Accepted))
            .await
            .unwrap();
        assert_eq!(accepted_only.len(), 1);
        assert_eq!(accepted_only[0].id, mine.id);

        // driver-1 has one request still pending on their ride.
        let for_driver = engine.pending_requests_for_driver("driver-1").await.unwrap();
        assert_eq!(for_driver.len(), 1);
        assert_eq!(for_driver[0].passenger_id, "passenger-2");

        let by_ride = engine.requests_by_ride(ride.id).await.unwrap();
        assert_eq!(by_ride.len(), 2);
    }

    #[tokio::test]
    async fn seat_invariants_hold_under_random_accept_cancel_sequences() {
        use rand::prelude::*;

        let engine = engine();
        let total_seats = 4;
        let ride = engine
            .create_ride(new_ride("driver-1", start(), end(), total_seats))
            .await
            .unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let mut request_ids = Vec::new();

        for round in 0..200u32 {
            match rng.gen_range(0..3) {
                0 => {
                    let seats = rng.gen_range(1..=3);
                    let passenger = format!("passenger-{}", round);
                    let request = engine
                        .create_request(NewRequest::new(ride.id, passenger, seats))
                        .await
                        .unwrap();
                    request_ids.push(request.id);
                }
                1 => {
                    if let Some(id) = request_ids.choose(&mut rng) {
                        // Conflicts and dead requests are expected here.
                        let _ = engine.accept_request(*id).await;
                    }
                }
                _ => {
                    if let Some(id) = request_ids.choose(&mut rng) {
                        let _ = engine.cancel_request(*id).await;
                    }
                }
            }

            let ride_now = engine.find_ride(ride.id).await.unwrap();
            let requests = engine.requests_by_ride(ride.id).await.unwrap();
            let held: u32 = requests
                .iter()
                .filter(|request| request.holds_seats())
                .map(|request| request.seats_needed)
                .sum();

            assert!(ride_now.available_seats <= total_seats);
            assert!(held <= total_seats);
            assert_eq!(ride_now.available_seats, total_seats - held);
        }
    }
}
