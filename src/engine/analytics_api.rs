use super::Engine;

use async_trait::async_trait;
use uuid::Uuid;

use crate::api::{AnalyticsAPI, DensityCell, PopularRoute, StatusStatistics};
use crate::error::{validation_error, Error};
use crate::geo::{BoundingBox, GeoPoint};
use crate::store::Store;

#[async_trait]
impl<S: Store> AnalyticsAPI for Engine<S> {
    #[tracing::instrument(skip(self))]
    async fn popular_routes(
        &self,
        center: GeoPoint,
        radius: f64,
        limit: usize,
    ) -> Result<Vec<PopularRoute>, Error> {
        if !center.is_valid() {
            return Err(validation_error("invalid center coordinates"));
        }
        if radius <= 0.0 || radius > 50_000.0 {
            return Err(validation_error("radius must be between 1 and 50000 meters"));
        }
        if limit == 0 || limit > 100 {
            return Err(validation_error("limit must be between 1 and 100"));
        }

        self.store.popular_routes(center, radius, limit).await
    }

    #[tracing::instrument(skip(self))]
    async fn density_heatmap(
        &self,
        bounds: BoundingBox,
        cell_size_deg: f64,
    ) -> Result<Vec<DensityCell>, Error> {
        if !bounds.is_valid() {
            return Err(validation_error("bounding box has min above max"));
        }
        if cell_size_deg <= 0.0 {
            return Err(validation_error("cell size must be positive"));
        }

        self.store.density_grid(bounds, cell_size_deg).await
    }

    #[tracing::instrument(skip(self))]
    async fn request_statistics(
        &self,
        ride_id: Option<Uuid>,
        passenger_id: Option<&str>,
    ) -> Result<Vec<StatusStatistics>, Error> {
        self.store.request_statistics(ride_id, passenger_id).await
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{AnalyticsAPI, NewRequest, RequestAPI, RideAPI};
    use crate::entities::{Location, RequestStatus};
    use crate::geo::{BoundingBox, GeoPoint};
    use crate::test_helpers::{engine, new_ride};

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng)
    }

    #[tokio::test]
    async fn popular_routes_group_by_address_pair() {
        let engine = engine();
        let start = p(52.5200, 13.4050);
        let end = p(52.4550, 13.5200);
        let other_end = p(52.5500, 13.3000);

        for i in 0..3 {
            let mut offer = new_ride(&format!("driver-{}", i), start, end, 2);
            offer.start = Location::new("Alexanderplatz", start);
            offer.end = Location::new("Schoenefeld", end);
            offer.price_per_seat = 10.0 + i as f64;
            engine.create_ride(offer).await.unwrap();
        }

        let mut offer = new_ride("driver-9", start, other_end, 2);
        offer.start = Location::new("Alexanderplatz", start);
        offer.end = Location::new("Tegel", other_end);
        engine.create_ride(offer).await.unwrap();

        let routes = engine.popular_routes(start, 5000.0, 10).await.unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].start_address, "Alexanderplatz");
        assert_eq!(routes[0].end_address, "Schoenefeld");
        assert_eq!(routes[0].ride_count, 3);
        assert!((routes[0].avg_price - 11.0).abs() < 1e-9);
        assert_eq!(routes[1].ride_count, 1);

        // A tight limit keeps only the top route.
        let top = engine.popular_routes(start, 5000.0, 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].ride_count, 3);
    }

    #[tokio::test]
    async fn heatmap_counts_ride_starts_per_cell() {
        use rand::prelude::*;
        use rand_distr::Normal;

        let engine = engine();
        let mut rng = StdRng::seed_from_u64(7);

        // Two clusters of departures, one denser than the other.
        let hot = Normal::new(0.0, 0.002).unwrap();
        for i in 0..8 {
            let start = p(52.52 + hot.sample(&mut rng), 13.40 + hot.sample(&mut rng));
            engine
                .create_ride(new_ride(&format!("hot-{}", i), start, p(52.45, 13.52), 2))
                .await
                .unwrap();
        }
        for i in 0..2 {
            let start = p(52.58 + hot.sample(&mut rng), 13.28 + hot.sample(&mut rng));
            engine
                .create_ride(new_ride(&format!("cold-{}", i), start, p(52.45, 13.52), 2))
                .await
                .unwrap();
        }

        let bounds = BoundingBox {
            min_lat: 52.40,
            max_lat: 52.70,
            min_lng: 13.20,
            max_lng: 13.60,
        };

        let cells = engine.density_heatmap(bounds, 0.05).await.unwrap();

        let total: u64 = cells.iter().map(|cell| cell.ride_count).sum();
        assert_eq!(total, 10);

        // Densest cell first, and its extent covers its center.
        assert!(cells[0].ride_count >= cells[cells.len() - 1].ride_count);
        for cell in &cells {
            assert!(cell.bounds.contains(cell.center));
            assert!(cell.avg_price > 0.0);
        }
    }

    #[tokio::test]
    async fn heatmap_validates_bounds_and_cell_size() {
        let engine = engine();

        let upside_down = BoundingBox {
            min_lat: 53.0,
            max_lat: 52.0,
            min_lng: 13.0,
            max_lng: 14.0,
        };
        assert!(engine
            .density_heatmap(upside_down, 0.05)
            .await
            .unwrap_err()
            .is_validation());

        let bounds = BoundingBox {
            min_lat: 52.0,
            max_lat: 53.0,
            min_lng: 13.0,
            max_lng: 14.0,
        };
        assert!(engine
            .density_heatmap(bounds, 0.0)
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn statistics_count_requests_per_status() {
        let engine = engine();
        let ride = engine
            .create_ride(new_ride(
                "driver-1",
                p(52.5200, 13.4050),
                p(52.4550, 13.5200),
                4,
            ))
            .await
            .unwrap();

        let accepted = engine
            .create_request(NewRequest::new(ride.id, "passenger-1", 1))
            .await
            .unwrap();
        engine.accept_request(accepted.id).await.unwrap();

        let rejected = engine
            .create_request(NewRequest::new(ride.id, "passenger-2", 1))
            .await
            .unwrap();
        engine.reject_request(rejected.id).await.unwrap();

        engine
            .create_request(NewRequest::new(ride.id, "passenger-3", 1))
            .await
            .unwrap();

        let stats = engine.request_statistics(Some(ride.id), None).await.unwrap();

        let of = |status: RequestStatus| {
            stats
                .iter()
                .find(|row| row.status == status)
                .map(|row| row.count)
                .unwrap_or(0)
        };
        assert_eq!(of(RequestStatus::Accepted), 1);
        assert_eq!(of(RequestStatus::Rejected), 1);
        assert_eq!(of(RequestStatus::Pending), 1);

        // Responded statuses carry a response latency; pending never does.
        let pending_row = stats
            .iter()
            .find(|row| row.status == RequestStatus::Pending)
            .unwrap();
        assert!(pending_row.avg_response_minutes.is_none());

        let accepted_row = stats
            .iter()
            .find(|row| row.status == RequestStatus::Accepted)
            .unwrap();
        assert!(accepted_row.avg_response_minutes.is_some());

        // Scoped to a different passenger: nothing.
        let none = engine
            .request_statistics(Some(ride.id), Some("passenger-99"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
