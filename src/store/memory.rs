use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::{DensityCell, PopularRoute, StatusStatistics};
use crate::entities::{RequestStatus, Ride, RideRequest, RideStatus};
use crate::error::{not_found_error, Error};
use crate::geo::{self, BoundingBox, GeoPoint};

use super::{
    MarketStats, ProximityFilter, RequestEvent, RouteFilter, Store, TransitionOutcome,
};

/// In-process store. Every predicate is evaluated with the `geo`
/// primitives; atomicity comes from holding the state lock across a whole
/// transition. Backs the test suite and embedded deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    rides: HashMap<Uuid, Ride>,
    requests: HashMap<Uuid, RideRequest>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn departs_on(ride: &Ride, date: NaiveDate) -> bool {
    ride.departure_time.date_naive() == date
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_ride(&self, ride: &Ride) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.rides.insert(ride.id, ride.clone());
        Ok(())
    }

    async fn fetch_ride(&self, id: Uuid) -> Result<Ride, Error> {
        let state = self.state.lock().await;
        state
            .rides
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found_error("ride"))
    }

    async fn update_ride_status(&self, id: Uuid, status: RideStatus) -> Result<Ride, Error> {
        let mut state = self.state.lock().await;

        let ride = state
            .rides
            .get_mut(&id)
            .ok_or_else(|| not_found_error("ride"))?;

        ride.transition(status)?;

        Ok(ride.clone())
    }

    async fn update_ride_location(&self, id: Uuid, point: GeoPoint) -> Result<Ride, Error> {
        let mut state = self.state.lock().await;

        let ride = state
            .rides
            .get_mut(&id)
            .ok_or_else(|| not_found_error("ride"))?;

        ride.update_location(point)?;

        Ok(ride.clone())
    }

    async fn open_rides_near(&self, filter: &ProximityFilter) -> Result<Vec<Ride>, Error> {
        let state = self.state.lock().await;

        let rides = state
            .rides
            .values()
            .filter(|ride| ride.is_open() && ride.available_seats >= filter.seats_needed)
            .filter(|ride| {
                geo::distance(ride.start.point, filter.query_start) <= filter.max_start_distance
                    && geo::distance(ride.end.point, filter.query_end)
                        <= filter.max_end_distance
            })
            .filter(|ride| filter.date.map_or(true, |date| departs_on(ride, date)))
            .filter(|ride| {
                filter
                    .max_price
                    .map_or(true, |max| ride.price_per_seat <= max)
            })
            .filter(|ride| {
                let prefs = &ride.preferences;
                filter
                    .allow_luggage
                    .map_or(true, |wanted| prefs.allow_luggage == wanted)
                    && filter
                        .allow_pets
                        .map_or(true, |wanted| prefs.allow_pets == wanted)
                    && filter
                        .allow_smoking
                        .map_or(true, |wanted| prefs.allow_smoking == wanted)
            })
            .cloned()
            .collect();

        Ok(rides)
    }

    async fn open_rides_along(&self, filter: &RouteFilter) -> Result<Vec<Ride>, Error> {
        let state = self.state.lock().await;

        // Bounding predicate only: expanded-box intersection pre-filters the
        // candidates; the engine computes the exact overlap ratio.
        let query_bbox = filter.route.bounding_box().map(|b| b.expand(filter.buffer));

        let rides = state
            .rides
            .values()
            .filter(|ride| ride.is_open() && ride.available_seats >= filter.seats_needed)
            .filter(|ride| !ride.planned_route.is_empty())
            .filter(|ride| filter.date.map_or(true, |date| departs_on(ride, date)))
            .filter(|ride| match (&query_bbox, &ride.bounding_box) {
                (Some(query), Some(candidate)) => query.intersects(candidate),
                _ => true,
            })
            .cloned()
            .collect();

        Ok(rides)
    }

    async fn rides_for_driver(&self, driver_id: &str) -> Result<Vec<Ride>, Error> {
        let state = self.state.lock().await;

        let mut rides: Vec<Ride> = state
            .rides
            .values()
            .filter(|ride| ride.driver_id == driver_id)
            .cloned()
            .collect();
        rides.sort_by_key(|ride| ride.created_at);

        Ok(rides)
    }

    async fn rides_for_passenger(&self, passenger_id: &str) -> Result<Vec<Ride>, Error> {
        let state = self.state.lock().await;

        let mut ride_ids: Vec<Uuid> = state
            .requests
            .values()
            .filter(|request| request.passenger_id == passenger_id)
            .map(|request| request.ride_id)
            .collect();
        ride_ids.sort();
        ride_ids.dedup();

        let mut rides: Vec<Ride> = ride_ids
            .into_iter()
            .filter_map(|id| state.rides.get(&id).cloned())
            .collect();
        rides.sort_by_key(|ride| ride.created_at);

        Ok(rides)
    }

    async fn insert_request(&self, request: &RideRequest) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn fetch_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        let state = self.state.lock().await;
        state
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found_error("ride request"))
    }

    async fn requests_by_ride(&self, ride_id: Uuid) -> Result<Vec<RideRequest>, Error> {
        let state = self.state.lock().await;

        let mut requests: Vec<RideRequest> = state
            .requests
            .values()
            .filter(|request| request.ride_id == ride_id)
            .cloned()
            .collect();
        requests.sort_by_key(|request| request.created_at);

        Ok(requests)
    }

    async fn requests_by_passenger(
        &self,
        passenger_id: &str,
        status: Option<RequestStatus>,
    ) -> Result<Vec<RideRequest>, Error> {
        let state = self.state.lock().await;

        let mut requests: Vec<RideRequest> = state
            .requests
            .values()
            .filter(|request| request.passenger_id == passenger_id)
            .filter(|request| status.map_or(true, |wanted| request.status == wanted))
            .cloned()
            .collect();
        requests.sort_by_key(|request| std::cmp::Reverse(request.created_at));

        Ok(requests)
    }

    async fn pending_requests_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<RideRequest>, Error> {
        let state = self.state.lock().await;

        let mut requests: Vec<RideRequest> = state
            .requests
            .values()
            .filter(|request| request.is_pending())
            .filter(|request| {
                state
                    .rides
                    .get(&request.ride_id)
                    .map_or(false, |ride| ride.driver_id == driver_id)
            })
            .cloned()
            .collect();
        requests.sort_by_key(|request| request.created_at);

        Ok(requests)
    }

    async fn pending_requests_near(
        &self,
        center: GeoPoint,
        radius: f64,
    ) -> Result<Vec<RideRequest>, Error> {
        let state = self.state.lock().await;

        let requests = state
            .requests
            .values()
            .filter(|request| request.is_pending())
            .filter(|request| {
                request
                    .requested_pickup
                    .as_ref()
                    .map_or(false, |pickup| geo::distance(pickup.point, center) <= radius)
            })
            .cloned()
            .collect();

        Ok(requests)
    }

    async fn transition_request(
        &self,
        id: Uuid,
        event: RequestEvent,
    ) -> Result<TransitionOutcome, Error> {
        let mut state = self.state.lock().await;
        let State { rides, requests } = &mut *state;

        // Work on a copy; nothing is written back until the whole
        // transition has succeeded.
        let mut request = requests
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found_error("ride request"))?;

        let outcome = match event {
            RequestEvent::Accept {
                reject_pending_when_full,
            } => {
                request.accept()?;

                let ride = rides
                    .get_mut(&request.ride_id)
                    .ok_or_else(|| not_found_error("ride"))?;
                let remaining = ride.reserve_seats(request.seats_needed)?;

                let mut auto_rejected = Vec::new();
                if remaining == 0 && reject_pending_when_full {
                    for other in requests.values_mut() {
                        if other.ride_id == request.ride_id && other.id != id && other.is_pending()
                        {
                            other.reject()?;
                            auto_rejected.push(other.clone());
                        }
                    }
                }

                TransitionOutcome {
                    request,
                    remaining_seats: Some(remaining),
                    auto_rejected,
                }
            }
            RequestEvent::Reject => {
                request.reject()?;
                TransitionOutcome {
                    request,
                    remaining_seats: None,
                    auto_rejected: Vec::new(),
                }
            }
            RequestEvent::Cancel => {
                let held_seats = request.cancel()?;

                let remaining = if held_seats {
                    let ride = rides
                        .get_mut(&request.ride_id)
                        .ok_or_else(|| not_found_error("ride"))?;
                    Some(ride.release_seats(request.seats_needed))
                } else {
                    None
                };

                TransitionOutcome {
                    request,
                    remaining_seats: remaining,
                    auto_rejected: Vec::new(),
                }
            }
            RequestEvent::Pickup => {
                request.pickup()?;
                TransitionOutcome {
                    request,
                    remaining_seats: None,
                    auto_rejected: Vec::new(),
                }
            }
            RequestEvent::Dropoff => {
                request.dropoff()?;
                TransitionOutcome {
                    request,
                    remaining_seats: None,
                    auto_rejected: Vec::new(),
                }
            }
        };

        requests.insert(id, outcome.request.clone());

        Ok(outcome)
    }

    async fn route_market_stats(
        &self,
        route: &crate::geo::Route,
        buffer: f64,
        since: DateTime<Utc>,
    ) -> Result<MarketStats, Error> {
        let state = self.state.lock().await;

        let prices: Vec<f64> = state
            .rides
            .values()
            .filter(|ride| ride.departure_time >= since)
            .filter(|ride| !ride.planned_route.is_empty())
            .filter(|ride| geo::overlap_ratio(&ride.planned_route, route, buffer) > 0.0)
            .map(|ride| ride.price_per_seat)
            .collect();

        let competitor_count = prices.len() as u64;
        let avg_price = if prices.is_empty() {
            None
        } else {
            Some(prices.iter().sum::<f64>() / prices.len() as f64)
        };

        Ok(MarketStats {
            avg_price,
            competitor_count,
        })
    }

    async fn popular_routes(
        &self,
        center: GeoPoint,
        radius: f64,
        limit: usize,
    ) -> Result<Vec<PopularRoute>, Error> {
        let state = self.state.lock().await;

        struct Bucket {
            count: u64,
            price_sum: f64,
            duration_sum: f64,
            distance_sum: f64,
            last_ride_at: DateTime<Utc>,
        }

        let mut buckets: HashMap<(String, String), Bucket> = HashMap::new();

        for ride in state
            .rides
            .values()
            .filter(|ride| geo::distance(ride.start.point, center) <= radius)
        {
            let key = (ride.start.address.clone(), ride.end.address.clone());
            let bucket = buckets.entry(key).or_insert(Bucket {
                count: 0,
                price_sum: 0.0,
                duration_sum: 0.0,
                distance_sum: 0.0,
                last_ride_at: ride.created_at,
            });

            bucket.count += 1;
            bucket.price_sum += ride.price_per_seat;
            bucket.duration_sum += ride.estimated_duration;
            bucket.distance_sum += ride.estimated_distance;
            bucket.last_ride_at = bucket.last_ride_at.max(ride.created_at);
        }

        let mut routes: Vec<PopularRoute> = buckets
            .into_iter()
            .map(|((start_address, end_address), bucket)| {
                let n = bucket.count as f64;
                PopularRoute {
                    start_address,
                    end_address,
                    ride_count: bucket.count,
                    avg_price: bucket.price_sum / n,
                    avg_duration: bucket.duration_sum / n,
                    avg_distance: bucket.distance_sum / n,
                    last_ride_at: bucket.last_ride_at,
                }
            })
            .collect();

        routes.sort_by(|a, b| b.ride_count.cmp(&a.ride_count));
        routes.truncate(limit);

        Ok(routes)
    }

    async fn density_grid(
        &self,
        bounds: BoundingBox,
        cell_size_deg: f64,
    ) -> Result<Vec<DensityCell>, Error> {
        let state = self.state.lock().await;

        struct Bucket {
            count: u64,
            price_sum: f64,
        }

        // Snap to the absolute grid (multiples of the cell size), matching
        // ST_SnapToGrid semantics.
        let mut cells: HashMap<(i64, i64), Bucket> = HashMap::new();

        for ride in state
            .rides
            .values()
            .filter(|ride| bounds.contains(ride.start.point))
        {
            let ix = (ride.start.point.longitude / cell_size_deg).floor() as i64;
            let iy = (ride.start.point.latitude / cell_size_deg).floor() as i64;

            let bucket = cells.entry((ix, iy)).or_insert(Bucket {
                count: 0,
                price_sum: 0.0,
            });
            bucket.count += 1;
            bucket.price_sum += ride.price_per_seat;
        }

        let mut grid: Vec<DensityCell> = cells
            .into_iter()
            .map(|((ix, iy), bucket)| {
                let min_lng = ix as f64 * cell_size_deg;
                let min_lat = iy as f64 * cell_size_deg;

                DensityCell {
                    center: GeoPoint::new(
                        min_lat + cell_size_deg / 2.0,
                        min_lng + cell_size_deg / 2.0,
                    ),
                    bounds: BoundingBox {
                        min_lat,
                        max_lat: min_lat + cell_size_deg,
                        min_lng,
                        max_lng: min_lng + cell_size_deg,
                    },
                    ride_count: bucket.count,
                    avg_price: bucket.price_sum / bucket.count as f64,
                }
            })
            .collect();

        grid.sort_by(|a, b| b.ride_count.cmp(&a.ride_count));

        Ok(grid)
    }

    async fn request_statistics(
        &self,
        ride_id: Option<Uuid>,
        passenger_id: Option<&str>,
    ) -> Result<Vec<StatusStatistics>, Error> {
        let state = self.state.lock().await;

        struct Bucket {
            count: u64,
            response_minutes_sum: f64,
            responded: u64,
        }

        let mut buckets: HashMap<RequestStatus, Bucket> = HashMap::new();

        for request in state
            .requests
            .values()
            .filter(|request| ride_id.map_or(true, |id| request.ride_id == id))
            .filter(|request| {
                passenger_id.map_or(true, |id| request.passenger_id == id)
            })
        {
            let bucket = buckets.entry(request.status).or_insert(Bucket {
                count: 0,
                response_minutes_sum: 0.0,
                responded: 0,
            });

            bucket.count += 1;
            if let Some(responded_at) = request.responded_at {
                let minutes = (responded_at - request.created_at).num_seconds() as f64 / 60.0;
                bucket.response_minutes_sum += minutes;
                bucket.responded += 1;
            }
        }

        let mut statistics: Vec<StatusStatistics> = buckets
            .into_iter()
            .map(|(status, bucket)| StatusStatistics {
                status,
                count: bucket.count,
                avg_response_minutes: (bucket.responded > 0)
                    .then(|| bucket.response_minutes_sum / bucket.responded as f64),
            })
            .collect();

        statistics.sort_by(|a, b| b.count.cmp(&a.count));

        Ok(statistics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_request, make_ride};
    use tokio_test::block_on;

    #[test]
    fn round_trips_and_not_found() {
        let store = MemoryStore::new();
        let ride = make_ride(2);

        block_on(store.insert_ride(&ride)).unwrap();
        assert_eq!(block_on(store.fetch_ride(ride.id)).unwrap().id, ride.id);

        let missing = block_on(store.fetch_ride(Uuid::new_v4())).unwrap_err();
        assert!(missing.is_not_found());

        let request = make_request(ride.id, 1);
        block_on(store.insert_request(&request)).unwrap();
        assert_eq!(
            block_on(store.fetch_request(request.id)).unwrap().id,
            request.id
        );
    }

    #[test]
    fn transition_on_missing_request_is_not_found() {
        let store = MemoryStore::new();

        let err = block_on(store.transition_request(
            Uuid::new_v4(),
            RequestEvent::Accept {
                reject_pending_when_full: true,
            },
        ))
        .unwrap_err();

        assert!(err.is_not_found());
    }
}
