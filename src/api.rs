use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::{
    Location, Preferences, Ride, RideRequest, RideStatus, RequestStatus, Vehicle,
};
use crate::error::Error;
use crate::geo::{BoundingBox, GeoPoint, Waypoint};

/// Ride offer as supplied by the driver's client.
#[derive(Clone, Debug, Deserialize)]
pub struct NewRide {
    pub driver_id: String,
    pub start: Location,
    pub end: Location,
    /// Route points with explicit order indices; start/end are prepended and
    /// appended when the waypoints leave them out.
    pub waypoints: Vec<Waypoint>,
    pub departure_time: DateTime<Utc>,
    pub seats: u32,
    pub price_per_seat: f64,
    pub vehicle: Vehicle,
    pub preferences: Preferences,
    /// Meters; derived from the planned route when absent.
    pub estimated_distance: Option<f64>,
    /// Minutes; estimated from the distance when absent.
    pub estimated_duration: Option<f64>,
}

/// A paginated result slice plus the total for the same predicate.
#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub total_pages: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    Distance,
    Price,
    Time,
}

/// Proximity search around a desired start and end point.
#[derive(Clone, Debug, Deserialize)]
pub struct ProximityQuery {
    pub query_start: GeoPoint,
    pub query_end: GeoPoint,
    /// Meters; 0 is legal and means exact-point match only.
    pub max_start_distance: f64,
    pub max_end_distance: f64,
    pub date: Option<NaiveDate>,
    pub seats_needed: u32,
    pub max_price: Option<f64>,
    pub allow_luggage: Option<bool>,
    pub allow_pets: Option<bool>,
    pub allow_smoking: Option<bool>,
    pub sort_by: SortBy,
    pub page: u32,
    pub limit: u32,
}

impl ProximityQuery {
    pub fn new(query_start: GeoPoint, query_end: GeoPoint) -> Self {
        Self {
            query_start,
            query_end,
            max_start_distance: 2000.0,
            max_end_distance: 2000.0,
            date: None,
            seats_needed: 1,
            max_price: None,
            allow_luggage: None,
            allow_pets: None,
            allow_smoking: None,
            sort_by: SortBy::Distance,
            page: 1,
            limit: 10,
        }
    }
}

/// A proximity search hit with the distances that ranked it.
#[derive(Clone, Debug, Serialize)]
pub struct RideMatch {
    pub ride: Ride,
    pub start_distance: f64,
    pub end_distance: f64,
    pub total_distance: f64,
}

/// Search for rides whose planned route overlaps a passenger's path.
#[derive(Clone, Debug, Deserialize)]
pub struct RouteSimilarityQuery {
    /// Query path in traversal order; at least two points.
    pub waypoints: Vec<GeoPoint>,
    /// Buffer radius in meters.
    pub max_route_distance: f64,
    /// Minimum overlap ratio in (0, 1].
    pub min_similarity: f64,
    pub date: Option<NaiveDate>,
    pub seats_needed: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct SimilarRide {
    pub ride: Ride,
    /// Meters of the ride's route inside the query buffer.
    pub shared_distance: f64,
    /// Full length of the ride's route, meters.
    pub route_length: f64,
    /// shared_distance / route_length.
    pub similarity: f64,
}

/// Ride request as supplied by the passenger's client.
#[derive(Clone, Debug, Deserialize)]
pub struct NewRequest {
    pub ride_id: Uuid,
    pub passenger_id: String,
    pub seats_needed: u32,
    pub message: Option<String>,
    pub pickup: Option<Location>,
    pub dropoff: Option<Location>,
    /// Reject the request outright when the computed detour exceeds this
    /// percentage. Falls back to the engine's policy default when absent.
    pub max_detour_percentage: Option<f64>,
}

impl NewRequest {
    pub fn new(ride_id: Uuid, passenger_id: impl Into<String>, seats_needed: u32) -> Self {
        Self {
            ride_id,
            passenger_id: passenger_id.into(),
            seats_needed,
            message: None,
            pickup: None,
            dropoff: None,
            max_detour_percentage: None,
        }
    }
}

/// Solver result: stops projected onto the ride's path, with the walking
/// legs the passenger accepts.
#[derive(Clone, Debug, Serialize)]
pub struct OptimalStops {
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    /// Meters from the passenger's start to the pickup projection.
    pub walk_to_pickup: f64,
    /// Meters from the dropoff projection to the passenger's destination.
    pub walk_from_dropoff: f64,
    /// Meters ridden between the two projections.
    pub ride_segment_distance: f64,
    pub total_detour_km: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NearbyRequest {
    pub request: RideRequest,
    pub distance_from_center: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    Driver,
    Passenger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySort {
    Date,
    Price,
    Distance,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HistoryQuery {
    pub role: HistoryRole,
    pub status: Option<RideStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub sort_by: HistorySort,
    pub descending: bool,
    pub page: u32,
    pub limit: u32,
}

impl HistoryQuery {
    pub fn new(role: HistoryRole) -> Self {
        Self {
            role,
            status: None,
            date_from: None,
            date_to: None,
            sort_by: HistorySort::Date,
            descending: true,
            page: 1,
            limit: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PriceQuery {
    pub start: GeoPoint,
    pub end: GeoPoint,
    pub waypoints: Vec<GeoPoint>,
    pub departure_time: DateTime<Utc>,
    pub seats: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandLevel {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PriceBreakdown {
    pub base_fare: f64,
    pub distance_fare: f64,
    pub time_fare: f64,
}

/// Advisory market context; computed on a best-effort basis and replaced by
/// configured defaults when the underlying query fails.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MarketAnalysis {
    pub average_price: f64,
    pub demand_level: DemandLevel,
    pub competitor_count: u64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct RouteInfo {
    /// Meters.
    pub distance: f64,
    /// Minutes.
    pub estimated_duration: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PriceSuggestion {
    pub suggested_price: f64,
    pub breakdown: PriceBreakdown,
    pub market: MarketAnalysis,
    pub route_info: RouteInfo,
}

#[derive(Clone, Debug, Serialize)]
pub struct PopularRoute {
    pub start_address: String,
    pub end_address: String,
    pub ride_count: u64,
    pub avg_price: f64,
    /// Minutes.
    pub avg_duration: f64,
    /// Meters.
    pub avg_distance: f64,
    pub last_ride_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct DensityCell {
    pub center: GeoPoint,
    pub bounds: BoundingBox,
    pub ride_count: u64,
    pub avg_price: f64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatusStatistics {
    pub status: RequestStatus,
    pub count: u64,
    /// Mean responded_at - created_at in minutes, over responded requests.
    pub avg_response_minutes: Option<f64>,
}

#[async_trait]
pub trait RideAPI {
    async fn create_ride(&self, new_ride: NewRide) -> Result<Ride, Error>;
    async fn find_ride(&self, id: Uuid) -> Result<Ride, Error>;
    async fn update_ride_status(&self, id: Uuid, status: RideStatus) -> Result<Ride, Error>;
    async fn update_ride_location(&self, id: Uuid, point: GeoPoint) -> Result<Ride, Error>;
    async fn ride_history(&self, user_id: &str, query: HistoryQuery)
        -> Result<Page<Ride>, Error>;
}

#[async_trait]
pub trait SearchAPI {
    async fn search_rides(&self, query: ProximityQuery) -> Result<Page<RideMatch>, Error>;
    async fn search_by_route(
        &self,
        query: RouteSimilarityQuery,
    ) -> Result<Vec<SimilarRide>, Error>;
}

#[async_trait]
pub trait RequestAPI {
    async fn create_request(&self, new_request: NewRequest) -> Result<RideRequest, Error>;
    async fn find_request(&self, id: Uuid) -> Result<RideRequest, Error>;
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
    async fn accept_request(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn reject_request(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn cancel_request(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn pickup_request(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn dropoff_request(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn find_optimal_stops(
        &self,
        ride_id: Uuid,
        passenger_start: GeoPoint,
        passenger_end: GeoPoint,
        max_detour_km: Option<f64>,
    ) -> Result<Option<OptimalStops>, Error>;
    async fn requests_near(
        &self,
        center: GeoPoint,
        radius: f64,
    ) -> Result<Vec<NearbyRequest>, Error>;
}

#[async_trait]
pub trait PricingAPI {
    async fn suggest_price(&self, query: PriceQuery) -> Result<PriceSuggestion, Error>;
}

#[async_trait]
pub trait AnalyticsAPI {
    async fn popular_routes(
        &self,
        center: GeoPoint,
        radius: f64,
        limit: usize,
    ) -> Result<Vec<PopularRoute>, Error>;
    async fn density_heatmap(
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

pub trait API: RideAPI + SearchAPI + RequestAPI + PricingAPI + AnalyticsAPI {}

pub type DynAPI = Arc<dyn API + Send + Sync>;
