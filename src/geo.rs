//! Geometry primitives for ride matching.
//!
//! Every distance in the engine is a haversine great-circle distance in
//! meters (mean earth radius 6 371 000 m); this is the one metric used by
//! proximity filters, route lengths, detour computation and the solver.
//! The Postgres store casts to `geography` so its `ST_Distance`/`ST_DWithin`
//! agree with these functions. Heatmap grid cells are the only exception:
//! they snap latitude/longitude directly, so cell sizes are in degrees.

use serde::{Deserialize, Serialize};

use crate::error::{validation_error, Error};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Geographic position in degrees. Immutable value type.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl From<GeoPoint> for geo_types::Point<f64> {
    fn from(p: GeoPoint) -> Self {
        geo_types::Point::new(p.longitude, p.latitude)
    }
}

impl From<GeoPoint> for geo_types::Geometry<f64> {
    fn from(p: GeoPoint) -> Self {
        geo_types::Point::from(p).into()
    }
}

/// Haversine distance between two points, in meters. Symmetric,
/// non-negative, zero for equal points.
pub fn distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lng1) = (a.latitude.to_radians(), a.longitude.to_radians());
    let (lat2, lng2) = (b.latitude.to_radians(), b.longitude.to_radians());

    let sin_dlat = ((lat2 - lat1) * 0.5).sin();
    let sin_dlng = ((lng2 - lng1) * 0.5).sin();

    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlng * sin_dlng;

    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// A route point with its explicit position in the polyline.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Waypoint {
    pub point: GeoPoint,
    pub order: i32,
}

impl Waypoint {
    pub fn new(point: GeoPoint, order: i32) -> Self {
        Self { point, order }
    }
}

/// Ordered polyline of geographic points. Construction normalizes waypoint
/// order, so the stored sequence is always the traversal order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Route {
    points: Vec<GeoPoint>,
}

impl Route {
    /// Builds a route from waypoints carrying explicit order indices.
    /// Points are sorted by order; duplicate order values are rejected.
    pub fn from_waypoints(mut waypoints: Vec<Waypoint>) -> Result<Self, Error> {
        waypoints.sort_by_key(|w| w.order);

        for pair in waypoints.windows(2) {
            if pair[0].order == pair[1].order {
                return Err(validation_error(format!(
                    "duplicate route point order {}",
                    pair[0].order
                )));
            }
        }

        Ok(Self {
            points: waypoints.into_iter().map(|w| w.point).collect(),
        })
    }

    /// Builds a route from points already in traversal order.
    pub fn from_points(points: Vec<GeoPoint>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.len() < 2
    }

    /// Sum of consecutive segment distances, in meters. Empty and
    /// single-point routes measure 0.
    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|pair| distance(pair[0], pair[1]))
            .sum()
    }

    pub fn segments(&self) -> impl Iterator<Item = (GeoPoint, GeoPoint)> + '_ {
        self.points.windows(2).map(|pair| (pair[0], pair[1]))
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(&self.points)
    }
}

impl From<&Route> for geo_types::LineString<f64> {
    fn from(route: &Route) -> Self {
        route
            .points
            .iter()
            .map(|p| geo_types::Point::new(p.longitude, p.latitude))
            .collect()
    }
}

impl From<&Route> for geo_types::Geometry<f64> {
    fn from(route: &Route) -> Self {
        geo_types::LineString::from(route).into()
    }
}

/// Axis-aligned rectangle enclosing a point set. Used as a cheap spatial
/// pre-filter before exact distance checks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Folds a point set into its bounding box; `None` for an empty set.
    pub fn from_points(points: &[GeoPoint]) -> Option<Self> {
        let first = points.first()?;

        let mut bbox = Self {
            min_lat: first.latitude,
            max_lat: first.latitude,
            min_lng: first.longitude,
            max_lng: first.longitude,
        };

        for p in &points[1..] {
            bbox.min_lat = bbox.min_lat.min(p.latitude);
            bbox.max_lat = bbox.max_lat.max(p.latitude);
            bbox.min_lng = bbox.min_lng.min(p.longitude);
            bbox.max_lng = bbox.max_lng.max(p.longitude);
        }

        Some(bbox)
    }

    pub fn is_valid(&self) -> bool {
        self.min_lat <= self.max_lat && self.min_lng <= self.max_lng
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) * 0.5,
            (self.min_lng + self.max_lng) * 0.5,
        )
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        p.latitude >= self.min_lat
            && p.latitude <= self.max_lat
            && p.longitude >= self.min_lng
            && p.longitude <= self.max_lng
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }

    /// Grows the box by roughly `meters` on every side. The longitude
    /// expansion is scaled by the latitude of the box center; a pre-filter
    /// only has to be conservative, not exact.
    pub fn expand(&self, meters: f64) -> Self {
        const METERS_PER_DEGREE: f64 = 111_320.0;

        let dlat = meters / METERS_PER_DEGREE;
        let cos_lat = self.center().latitude.to_radians().cos().abs().max(0.01);
        let dlng = meters / (METERS_PER_DEGREE * cos_lat);

        Self {
            min_lat: self.min_lat - dlat,
            max_lat: self.max_lat + dlat,
            min_lng: self.min_lng - dlng,
            max_lng: self.max_lng + dlng,
        }
    }
}

/// Orthogonal projection of `p` onto the segment `a`-`b`, clamped to the
/// segment. Projection happens in a local equirectangular plane around `a`,
/// which is accurate at the segment lengths rides use.
pub fn nearest_point_on_segment(p: GeoPoint, a: GeoPoint, b: GeoPoint) -> GeoPoint {
    let cos_lat = a.latitude.to_radians().cos();

    let to_plane = |q: GeoPoint| {
        (
            (q.longitude - a.longitude).to_radians() * cos_lat,
            (q.latitude - a.latitude).to_radians(),
        )
    };

    let (px, py) = to_plane(p);
    let (bx, by) = to_plane(b);

    let len2 = bx * bx + by * by;
    if len2 == 0.0 {
        return a;
    }

    let t = ((px * bx + py * by) / len2).clamp(0.0, 1.0);

    point_along(a, b, t)
}

/// Linear interpolation between two points.
fn point_along(a: GeoPoint, b: GeoPoint, t: f64) -> GeoPoint {
    GeoPoint::new(
        a.latitude + (b.latitude - a.latitude) * t,
        a.longitude + (b.longitude - a.longitude) * t,
    )
}

/// Minimum distance from a point to a route, in meters. An empty route is
/// infinitely far away.
pub fn distance_to_route(p: GeoPoint, route: &Route) -> f64 {
    let points = route.points();

    match points.len() {
        0 => f64::INFINITY,
        1 => distance(p, points[0]),
        _ => route
            .segments()
            .map(|(a, b)| distance(p, nearest_point_on_segment(p, a, b)))
            .fold(f64::INFINITY, f64::min),
    }
}

/// Fraction of `candidate`'s length that lies within `buffer_radius` meters
/// of `query`, in [0, 1]. Zero-length candidates score 0.
///
/// The ratio divides by the candidate's own length, so it is deliberately
/// asymmetric: overlap_ratio(a, b, r) measures how much of the posted ride's
/// route the query shares, not the reverse. Callers rank posted rides, so
/// the candidate side is always the ride under evaluation.
pub fn overlap_ratio(candidate: &Route, query: &Route, buffer_radius: f64) -> f64 {
    let total = candidate.length();
    if total <= 0.0 || query.points().is_empty() {
        return 0.0;
    }

    // Measure by subdividing each candidate segment and testing subsegment
    // midpoints against the query buffer.
    let step = (buffer_radius / 2.0).clamp(10.0, 250.0);

    let mut covered = 0.0;
    for (a, b) in candidate.segments() {
        let seg_len = distance(a, b);
        if seg_len == 0.0 {
            continue;
        }

        let pieces = (seg_len / step).ceil().max(1.0) as usize;
        let inside = (0..pieces)
            .filter(|i| {
                let t_mid = (*i as f64 + 0.5) / pieces as f64;
                distance_to_route(point_along(a, b, t_mid), query) <= buffer_radius
            })
            .count();

        // Scale once per segment so a fully covered candidate measures
        // exactly its own length.
        covered += seg_len * (inside as f64 / pieces as f64);
    }

    (covered / total).clamp(0.0, 1.0)
}
