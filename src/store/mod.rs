//! The geometric store interface.
//!
//! Matching algorithms talk to storage through structured predicates
//! (radius around a point, buffer around a route, grid snap, address-pair
//! grouping) instead of any particular store's geometry dialect. Two
//! implementations ship: an in-process [`MemoryStore`] evaluating every
//! predicate with the `geo` primitives, and a Postgres/PostGIS [`PgStore`]
//! expressing the same predicates in SQL.
//!
//! [`transition_request`](Store::transition_request) is the engine's one
//! critical section: a request state transition and its seat side effects
//! commit as a single atomic unit or not at all.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::api::{DensityCell, PopularRoute, StatusStatistics};
use crate::entities::{RequestStatus, Ride, RideRequest, RideStatus};
use crate::error::Error;
use crate::geo::{BoundingBox, GeoPoint, Route};

/// Bounding predicate for proximity search: open rides with enough seats
/// whose endpoints fall inside the paired radii.
#[derive(Clone, Debug)]
pub struct ProximityFilter {
    pub query_start: GeoPoint,
    pub query_end: GeoPoint,
    pub max_start_distance: f64,
    pub max_end_distance: f64,
    pub seats_needed: u32,
    pub date: Option<NaiveDate>,
    pub max_price: Option<f64>,
    pub allow_luggage: Option<bool>,
    pub allow_pets: Option<bool>,
    pub allow_smoking: Option<bool>,
}

/// Bounding predicate for route-similarity search: open rides whose
/// non-empty planned route comes within `buffer` meters of the query route.
#[derive(Clone, Debug)]
pub struct RouteFilter {
    pub route: Route,
    pub buffer: f64,
    pub seats_needed: u32,
    pub date: Option<NaiveDate>,
}

/// One request state transition, executed atomically by the store.
#[derive(Clone, Copy, Debug)]
pub enum RequestEvent {
    /// Check-then-decrement the ride's seats, and optionally cascade-reject
    /// its other pending requests when none remain.
    Accept { reject_pending_when_full: bool },
    Reject,
    /// Returns held seats to the ride when cancelling an accepted request.
    Cancel,
    Pickup,
    Dropoff,
}

/// Result of an atomic request transition.
#[derive(Clone, Debug)]
pub struct TransitionOutcome {
    pub request: RideRequest,
    /// Seats remaining on the ride, when the transition changed them.
    pub remaining_seats: Option<u32>,
    /// Pending requests bulk-rejected because the accept took the last seat.
    pub auto_rejected: Vec<RideRequest>,
}

/// Aggregate over rides whose route lies within a buffer of a query route.
#[derive(Clone, Copy, Debug)]
pub struct MarketStats {
    pub avg_price: Option<f64>,
    pub competitor_count: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // rides
    async fn insert_ride(&self, ride: &Ride) -> Result<(), Error>;
    /// NotFound when absent; callers always branch on the error.
    async fn fetch_ride(&self, id: Uuid) -> Result<Ride, Error>;
    /// Atomic fetch-transition-write of a lifecycle change; the entity's
    /// state machine decides whether the edge is legal.
    async fn update_ride_status(&self, id: Uuid, status: RideStatus) -> Result<Ride, Error>;
    /// Atomic fetch-validate-write of a live position fix.
    async fn update_ride_location(&self, id: Uuid, point: GeoPoint) -> Result<Ride, Error>;
    async fn open_rides_near(&self, filter: &ProximityFilter) -> Result<Vec<Ride>, Error>;
    async fn open_rides_along(&self, filter: &RouteFilter) -> Result<Vec<Ride>, Error>;
    async fn rides_for_driver(&self, driver_id: &str) -> Result<Vec<Ride>, Error>;
    /// Rides the passenger has requested a seat on, deduplicated.
    async fn rides_for_passenger(&self, passenger_id: &str) -> Result<Vec<Ride>, Error>;

    // requests
    async fn insert_request(&self, request: &RideRequest) -> Result<(), Error>;
    async fn fetch_request(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn requests_by_ride(&self, ride_id: Uuid) -> Result<Vec<RideRequest>, Error>;
    async fn requests_by_passenger(
        &self,
        passenger_id: &str,
        status: Option<RequestStatus>,
    ) -> Result<Vec<RideRequest>, Error>;
    async fn pending_requests_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<RideRequest>, Error>;
    /// Pending requests whose requested pickup lies within `radius` meters
    /// of `center`.
    async fn pending_requests_near(
        &self,
        center: GeoPoint,
        radius: f64,
    ) -> Result<Vec<RideRequest>, Error>;

    /// The critical section. Implementations must guarantee the state write
    /// and any seat change land together or not at all, and that two
    /// concurrent accepts can never oversell a ride.
    async fn transition_request(
        &self,
        id: Uuid,
        event: RequestEvent,
    ) -> Result<TransitionOutcome, Error>;

    // aggregation predicates
    async fn route_market_stats(
        &self,
        route: &Route,
        buffer: f64,
        since: DateTime<Utc>,
    ) -> Result<MarketStats, Error>;
    async fn popular_routes(
        &self,
        center: GeoPoint,
        radius: f64,
        limit: usize,
    ) -> Result<Vec<PopularRoute>, Error>;
    async fn density_grid(
        &self,
        bounds: BoundingBox,
        cell_size_deg: f64,
    ) -> Result<Vec<DensityCell>, Error>;
    async fn request_statistics(
        &self,
        ride_id: Option<Uuid>,
        passenger_id: Option<&str>,
    ) -> Result<Vec<StatusStatistics>, Error>;
}
