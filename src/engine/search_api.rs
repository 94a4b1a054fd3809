use super::{paginate, round2, round3, Engine};

use async_trait::async_trait;
use std::cmp::Ordering;

use crate::api::{Page, ProximityQuery, RideMatch, RouteSimilarityQuery, SearchAPI, SimilarRide, SortBy};
use crate::error::{validation_error, Error};
use crate::geo::{self, Route};
use crate::store::{ProximityFilter, RouteFilter, Store};

fn by_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[async_trait]
impl<S: Store> SearchAPI for Engine<S> {
    #[tracing::instrument(skip(self))]
    async fn search_rides(&self, query: ProximityQuery) -> Result<Page<RideMatch>, Error> {
        if !query.query_start.is_valid() || !query.query_end.is_valid() {
            return Err(validation_error("invalid search coordinates"));
        }
        if query.max_start_distance < 0.0 || query.max_end_distance < 0.0 {
            return Err(validation_error("search radius must not be negative"));
        }
        if query.seats_needed == 0 || query.seats_needed > 8 {
            return Err(validation_error("seats needed must be between 1 and 8"));
        }
        if query.max_price.is_some_and(|price| price < 0.0) {
            return Err(validation_error("max price must not be negative"));
        }
        if query.page == 0 {
            return Err(validation_error("page is 1-based"));
        }
        if query.limit == 0 || query.limit > 100 {
            return Err(validation_error("limit must be between 1 and 100"));
        }

        let filter = ProximityFilter {
            query_start: query.query_start,
            query_end: query.query_end,
            max_start_distance: query.max_start_distance,
            max_end_distance: query.max_end_distance,
            seats_needed: query.seats_needed,
            date: query.date,
            max_price: query.max_price,
            allow_luggage: query.allow_luggage,
            allow_pets: query.allow_pets,
            allow_smoking: query.allow_smoking,
        };

        let candidates = self.store.open_rides_near(&filter).await?;
        tracing::info!(candidates = candidates.len(), "proximity candidates fetched");

        // The store's radius predicate is a bounding filter; re-check with
        // the engine's own metric so results are exact.
        let mut matches: Vec<RideMatch> = candidates
            .into_iter()
            .map(|ride| {
                let start_distance = geo::distance(ride.start.point, query.query_start);
                let end_distance = geo::distance(ride.end.point, query.query_end);

                RideMatch {
                    start_distance,
                    end_distance,
                    total_distance: start_distance + end_distance,
                    ride,
                }
            })
            .filter(|m| {
                m.start_distance <= query.max_start_distance
                    && m.end_distance <= query.max_end_distance
            })
            .collect();

        match query.sort_by {
            SortBy::Distance => matches.sort_by(|a, b| by_f64(a.total_distance, b.total_distance)),
            SortBy::Price => matches
                .sort_by(|a, b| by_f64(a.ride.price_per_seat, b.ride.price_per_seat)),
            SortBy::Time => matches.sort_by_key(|m| m.ride.departure_time),
        }

        Ok(paginate(matches, query.page, query.limit))
    }

    #[tracing::instrument(skip(self))]
    async fn search_by_route(
        &self,
        query: RouteSimilarityQuery,
    ) -> Result<Vec<SimilarRide>, Error> {
        if query.waypoints.len() < 2 {
            return Err(validation_error("a query route needs at least two points"));
        }
        if query.waypoints.iter().any(|point| !point.is_valid()) {
            return Err(validation_error("invalid route coordinates"));
        }
        if query.max_route_distance <= 0.0 {
            return Err(validation_error("route buffer must be positive"));
        }
        if !(query.min_similarity > 0.0 && query.min_similarity <= 1.0) {
            return Err(validation_error("min similarity must be in (0, 1]"));
        }
        if query.seats_needed == 0 || query.seats_needed > 8 {
            return Err(validation_error("seats needed must be between 1 and 8"));
        }

        let route = Route::from_points(query.waypoints);

        let filter = RouteFilter {
            route: route.clone(),
            buffer: query.max_route_distance,
            seats_needed: query.seats_needed,
            date: query.date,
        };

        let candidates = self.store.open_rides_along(&filter).await?;
        tracing::info!(candidates = candidates.len(), "route candidates fetched");

        let mut similar: Vec<SimilarRide> = candidates
            .into_iter()
            .filter_map(|ride| {
                let ratio =
                    geo::overlap_ratio(&ride.planned_route, &route, query.max_route_distance);
                if ratio < query.min_similarity {
                    return None;
                }

                let route_length = ride.planned_route.length();
                Some(SimilarRide {
                    shared_distance: round2(ratio * route_length),
                    route_length: round2(route_length),
                    similarity: round3(ratio),
                    ride,
                })
            })
            .collect();

        similar.sort_by(|a, b| by_f64(b.similarity, a.similarity));

        Ok(similar)
    }
}
