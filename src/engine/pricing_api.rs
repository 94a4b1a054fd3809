use super::{round2, Engine};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::api::{
    DemandLevel, MarketAnalysis, PriceBreakdown, PriceQuery, PriceSuggestion, PricingAPI,
    RouteInfo,
};
use crate::error::{validation_error, Error};
use crate::geo::{GeoPoint, Route};
use crate::store::{MarketStats, Store};

#[async_trait]
impl<S: Store> PricingAPI for Engine<S> {
    #[tracing::instrument(skip(self))]
    async fn suggest_price(&self, query: PriceQuery) -> Result<PriceSuggestion, Error> {
        if !query.start.is_valid() || !query.end.is_valid() {
            return Err(validation_error("invalid route coordinates"));
        }
        if query.waypoints.iter().any(|point| !point.is_valid()) {
            return Err(validation_error("invalid waypoint coordinates"));
        }
        if query.seats == 0 || query.seats > 8 {
            return Err(validation_error("seats must be between 1 and 8"));
        }

        let mut points: Vec<GeoPoint> = Vec::with_capacity(query.waypoints.len() + 2);
        points.push(query.start);
        points.extend(query.waypoints.iter().copied());
        points.push(query.end);

        let route = Route::from_points(points);
        let distance = route.length();

        let base_fare = self.config.base_fare;
        let distance_fare = round2(distance / 1000.0 * self.config.per_km_rate);
        let time_fare = if self.config.is_peak(query.departure_time) {
            self.config.peak_surcharge
        } else {
            0.0
        };

        // Market context is advisory: a failed or empty market query falls
        // back to configured defaults instead of failing the suggestion.
        let since = Utc::now() - Duration::days(self.config.market_window_days);
        let stats = match self
            .store
            .route_market_stats(&route, self.config.market_buffer, since)
            .await
        {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!(?err, "market analysis failed, using fallback defaults");
                MarketStats {
                    avg_price: None,
                    competitor_count: 0,
                }
            }
        };

        let average_price = round2(
            stats
                .avg_price
                .unwrap_or(self.config.market_fallback_avg_price),
        );
        let demand_level = if stats.competitor_count > self.config.demand_high_threshold {
            DemandLevel::High
        } else if stats.competitor_count > self.config.demand_medium_threshold {
            DemandLevel::Medium
        } else {
            DemandLevel::Low
        };

        Ok(PriceSuggestion {
            suggested_price: round2(base_fare + distance_fare + time_fare),
            breakdown: PriceBreakdown {
                base_fare,
                distance_fare,
                time_fare,
            },
            market: MarketAnalysis {
                average_price,
                demand_level,
                competitor_count: stats.competitor_count,
            },
            route_info: RouteInfo {
                distance: distance.round(),
                estimated_duration: (distance / 1000.0 * 2.0).round(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::api::{DemandLevel, PriceQuery, PricingAPI, RideAPI};
    use crate::geo::GeoPoint;
    use crate::test_helpers::{engine, new_ride};

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng)
    }

    fn query_at(hour: u32) -> PriceQuery {
        PriceQuery {
            start: p(52.50, 13.30),
            end: p(52.50, 13.50),
            waypoints: vec![],
            departure_time: Utc.with_ymd_and_hms(2024, 5, 6, hour, 0, 0).unwrap(),
            seats: 2,
        }
    }

    #[tokio::test]
    async fn peak_departure_carries_a_time_fare() {
        let engine = engine();

        let rush_hour = engine.suggest_price(query_at(8)).await.unwrap();
        assert_eq!(rush_hour.breakdown.time_fare, 5.0);

        let afternoon = engine.suggest_price(query_at(14)).await.unwrap();
        assert_eq!(afternoon.breakdown.time_fare, 0.0);

        assert!(rush_hour.suggested_price > afternoon.suggested_price);
    }

    #[tokio::test]
    async fn price_sums_its_breakdown() {
        let engine = engine();
        let suggestion = engine.suggest_price(query_at(14)).await.unwrap();

        let b = suggestion.breakdown;
        let expected = b.base_fare + b.distance_fare + b.time_fare;
        assert!((suggestion.suggested_price - expected).abs() < 0.01);

        // ~13.6 km along the corridor at 2.5/km on top of the base fare.
        assert!(suggestion.breakdown.distance_fare > 0.0);
        assert!(suggestion.route_info.distance > 10_000.0);
    }

    #[tokio::test]
    async fn empty_market_reports_fallback_average_and_low_demand() {
        let engine = engine();
        let suggestion = engine.suggest_price(query_at(14)).await.unwrap();

        assert_eq!(suggestion.market.average_price, 25.0);
        assert_eq!(suggestion.market.competitor_count, 0);
        assert_eq!(suggestion.market.demand_level, DemandLevel::Low);
    }

    #[tokio::test]
    async fn competitors_on_the_corridor_raise_the_demand_level() {
        let engine = engine();

        for i in 0..6 {
            let mut offer = new_ride(
                &format!("driver-{}", i),
                p(52.50, 13.30),
                p(52.50, 13.50),
                2,
            );
            offer.price_per_seat = 18.0;
            engine.create_ride(offer).await.unwrap();
        }

        let suggestion = engine.suggest_price(query_at(14)).await.unwrap();

        assert_eq!(suggestion.market.competitor_count, 6);
        assert_eq!(suggestion.market.demand_level, DemandLevel::High);
        assert_eq!(suggestion.market.average_price, 18.0);
    }
}
