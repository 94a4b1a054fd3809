use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use geo_types::Geometry;
use geozero::wkb;
use sqlx::postgres::PgPoolOptions;
use sqlx::{types::Json, Acquire, Executor, Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::api::{DensityCell, PopularRoute, StatusStatistics};
use crate::entities::{RequestStatus, Ride, RideRequest, RideStatus};
use crate::error::{not_found_error, Error};
use crate::geo::{BoundingBox, GeoPoint, Route};

use super::{
    MarketStats, ProximityFilter, RequestEvent, RouteFilter, Store, TransitionOutcome,
};

type Database = Postgres;

/// Postgres/PostGIS store. Entities persist as JSONB documents beside the
/// geometry columns the spatial predicates index; `geography` casts keep
/// every distance in meters, matching `geo::distance`.
#[derive(Debug)]
pub struct PgStore {
    pool: Pool<Database>,
}

impl PgStore {
    #[tracing::instrument]
    pub async fn connect(db_uri: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_uri)
            .await?;

        Self::new(pool).await
    }

    #[tracing::instrument(skip(pool))]
    pub async fn new(pool: Pool<Database>) -> Result<Self, Error> {
        // TODO: move schema setup to migrations
        pool.execute("CREATE EXTENSION IF NOT EXISTS postgis").await?;

        pool.execute(
            "CREATE TABLE IF NOT EXISTS rides (
                id UUID PRIMARY KEY,
                driver_id VARCHAR NOT NULL,
                status VARCHAR NOT NULL,
                departure_time TIMESTAMPTZ NOT NULL,
                available_seats INT4 NOT NULL,
                price_per_seat FLOAT8 NOT NULL,
                start_point geometry(Point, 4326) NOT NULL,
                end_point geometry(Point, 4326) NOT NULL,
                planned_route geometry(LineString, 4326),
                data JSONB NOT NULL
            )",
        )
        .await?;

        pool.execute(
            "CREATE TABLE IF NOT EXISTS ride_requests (
                id UUID PRIMARY KEY,
                ride_id UUID NOT NULL REFERENCES rides(id),
                passenger_id VARCHAR NOT NULL,
                status VARCHAR NOT NULL,
                pickup_point geometry(Point, 4326),
                data JSONB NOT NULL
            )",
        )
        .await?;

        pool.execute("CREATE INDEX IF NOT EXISTS rides_start_point_idx ON rides USING GIST (start_point)")
            .await?;
        pool.execute("CREATE INDEX IF NOT EXISTS rides_planned_route_idx ON rides USING GIST (planned_route)")
            .await?;
        pool.execute("CREATE INDEX IF NOT EXISTS ride_requests_ride_id_idx ON ride_requests (ride_id)")
            .await?;

        Ok(Self { pool })
    }
}

#[tracing::instrument(skip(tx))]
async fn fetch_ride_for_update(
    tx: &mut Transaction<'_, Database>,
    id: &Uuid,
) -> Result<Ride, Error> {
    let Json(ride): Json<Ride> = tx
        .fetch_optional(sqlx::query("SELECT data FROM rides WHERE id = $1 FOR UPDATE").bind(id))
        .await?
        .ok_or_else(|| not_found_error("ride"))?
        .try_get("data")?;

    Ok(ride)
}

#[tracing::instrument(skip(tx))]
async fn fetch_request_for_update(
    tx: &mut Transaction<'_, Database>,
    id: &Uuid,
) -> Result<RideRequest, Error> {
    let Json(request): Json<RideRequest> = tx
        .fetch_optional(
            sqlx::query("SELECT data FROM ride_requests WHERE id = $1 FOR UPDATE").bind(id),
        )
        .await?
        .ok_or_else(|| not_found_error("ride request"))?
        .try_get("data")?;

    Ok(request)
}

#[tracing::instrument(skip(tx, ride))]
async fn update_ride_row(tx: &mut Transaction<'_, Database>, ride: &Ride) -> Result<(), Error> {
    tx.execute(
        sqlx::query(
            "UPDATE rides SET status = $2, departure_time = $3, available_seats = $4,
             price_per_seat = $5, data = $6 WHERE id = $1",
        )
        .bind(&ride.id)
        .bind(ride.status.name())
        .bind(ride.departure_time)
        .bind(ride.available_seats as i32)
        .bind(ride.price_per_seat)
        .bind(Json(ride)),
    )
    .await?;

    Ok(())
}

#[tracing::instrument(skip(tx, request))]
async fn update_request_row(
    tx: &mut Transaction<'_, Database>,
    request: &RideRequest,
) -> Result<(), Error> {
    tx.execute(
        sqlx::query("UPDATE ride_requests SET status = $2, data = $3 WHERE id = $1")
            .bind(&request.id)
            .bind(request.status.name())
            .bind(Json(request)),
    )
    .await?;

    Ok(())
}

fn point_geom(p: GeoPoint) -> wkb::Encode<Geometry<f64>> {
    wkb::Encode(p.into())
}

fn route_geom(route: &Route) -> wkb::Encode<Geometry<f64>> {
    wkb::Encode(route.into())
}

fn parse_status(name: &str) -> Result<RequestStatus, Error> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(crate::error::database_error)
}

#[async_trait]
impl Store for PgStore {
    #[tracing::instrument(skip(self, ride))]
    async fn insert_ride(&self, ride: &Ride) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query(
                "INSERT INTO rides (
                    id, driver_id, status, departure_time, available_seats,
                    price_per_seat, start_point, end_point, planned_route, data
                ) VALUES (
                    $1, $2, $3, $4, $5, $6,
                    ST_SetSRID($7, 4326), ST_SetSRID($8, 4326), ST_SetSRID($9, 4326), $10
                )",
            )
            .bind(&ride.id)
            .bind(&ride.driver_id)
            .bind(ride.status.name())
            .bind(ride.departure_time)
            .bind(ride.available_seats as i32)
            .bind(ride.price_per_seat)
            .bind(point_geom(ride.start.point))
            .bind(point_geom(ride.end.point))
            .bind(route_geom(&ride.planned_route))
            .bind(Json(ride)),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_ride(&self, id: Uuid) -> Result<Ride, Error> {
        let mut conn = self.pool.acquire().await?;

        let maybe_result = conn
            .fetch_optional(sqlx::query("SELECT data FROM rides WHERE id = $1").bind(&id))
            .await?;

        let result = maybe_result.ok_or_else(|| not_found_error("ride"))?;
        let Json(ride) = result.try_get("data")?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn update_ride_status(&self, id: Uuid, status: RideStatus) -> Result<Ride, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        // The row lock keeps the write from interleaving with an accept.
        let mut ride = fetch_ride_for_update(&mut tx, &id).await?;
        ride.transition(status)?;
        update_ride_row(&mut tx, &ride).await?;

        tx.commit().await?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn update_ride_location(&self, id: Uuid, point: GeoPoint) -> Result<Ride, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let mut ride = fetch_ride_for_update(&mut tx, &id).await?;
        ride.update_location(point)?;
        update_ride_row(&mut tx, &ride).await?;

        tx.commit().await?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn open_rides_near(&self, filter: &ProximityFilter) -> Result<Vec<Ride>, Error> {
        let query = "
            SELECT data FROM rides
            WHERE
                status = 'PENDING'
                AND available_seats >= $3
                AND ST_DWithin(start_point::geography, ST_SetSRID($1, 4326)::geography, $4)
                AND ST_DWithin(end_point::geography, ST_SetSRID($2, 4326)::geography, $5)
                AND ($6::date IS NULL OR DATE(departure_time) = $6)
                AND ($7::float8 IS NULL OR price_per_seat <= $7)
                AND ($8::boolean IS NULL OR (data #>> '{preferences,allow_luggage}')::boolean = $8)
                AND ($9::boolean IS NULL OR (data #>> '{preferences,allow_pets}')::boolean = $9)
                AND ($10::boolean IS NULL OR (data #>> '{preferences,allow_smoking}')::boolean = $10)
        ";

        let mut conn = self.pool.acquire().await?;

        let mut rows = conn.fetch(
            sqlx::query(query)
                .bind(point_geom(filter.query_start))
                .bind(point_geom(filter.query_end))
                .bind(filter.seats_needed as i32)
                .bind(filter.max_start_distance)
                .bind(filter.max_end_distance)
                .bind(filter.date)
                .bind(filter.max_price)
                .bind(filter.allow_luggage)
                .bind(filter.allow_pets)
                .bind(filter.allow_smoking),
        );

        let mut rides = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let Json(ride): Json<Ride> = row.try_get("data")?;
            rides.push(ride);
        }

        Ok(rides)
    }

    #[tracing::instrument(skip(self))]
    async fn open_rides_along(&self, filter: &RouteFilter) -> Result<Vec<Ride>, Error> {
        let query = "
            SELECT data FROM rides
            WHERE
                status = 'PENDING'
                AND available_seats >= $2
                AND planned_route IS NOT NULL
                AND ST_Length(planned_route) > 0
                AND ST_DWithin(planned_route::geography, ST_SetSRID($1, 4326)::geography, $3)
                AND ($4::date IS NULL OR DATE(departure_time) = $4)
        ";

        let mut conn = self.pool.acquire().await?;

        let mut rows = conn.fetch(
            sqlx::query(query)
                .bind(route_geom(&filter.route))
                .bind(filter.seats_needed as i32)
                .bind(filter.buffer)
                .bind(filter.date),
        );

        let mut rides = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let Json(ride): Json<Ride> = row.try_get("data")?;
            rides.push(ride);
        }

        Ok(rides)
    }

    #[tracing::instrument(skip(self))]
    async fn rides_for_driver(&self, driver_id: &str) -> Result<Vec<Ride>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "SELECT data FROM rides WHERE driver_id = $1
                     ORDER BY (data->>'created_at')::timestamptz ASC",
                )
                .bind(driver_id),
            )
            .await?;

        let mut rides = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(ride): Json<Ride> = row.try_get("data")?;
            rides.push(ride);
        }

        Ok(rides)
    }

    #[tracing::instrument(skip(self))]
    async fn rides_for_passenger(&self, passenger_id: &str) -> Result<Vec<Ride>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "SELECT DISTINCT ON (r.id) r.data FROM rides r
                     JOIN ride_requests rr ON rr.ride_id = r.id
                     WHERE rr.passenger_id = $1
                     ORDER BY r.id",
                )
                .bind(passenger_id),
            )
            .await?;

        let mut rides = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(ride): Json<Ride> = row.try_get("data")?;
            rides.push(ride);
        }

        rides.sort_by_key(|ride| ride.created_at);

        Ok(rides)
    }

    #[tracing::instrument(skip(self, request))]
    async fn insert_request(&self, request: &RideRequest) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        let pickup = request
            .requested_pickup
            .as_ref()
            .map(|location| point_geom(location.point));

        conn.execute(
            sqlx::query(
                "INSERT INTO ride_requests (id, ride_id, passenger_id, status, pickup_point, data)
                 VALUES ($1, $2, $3, $4, ST_SetSRID($5, 4326), $6)",
            )
            .bind(&request.id)
            .bind(&request.ride_id)
            .bind(&request.passenger_id)
            .bind(request.status.name())
            .bind(pickup)
            .bind(Json(request)),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_request(&self, id: Uuid) -> Result<RideRequest, Error> {
        let mut conn = self.pool.acquire().await?;

        let maybe_result = conn
            .fetch_optional(sqlx::query("SELECT data FROM ride_requests WHERE id = $1").bind(&id))
            .await?;

        let result = maybe_result.ok_or_else(|| not_found_error("ride request"))?;
        let Json(request) = result.try_get("data")?;

        Ok(request)
    }

    #[tracing::instrument(skip(self))]
    async fn requests_by_ride(&self, ride_id: Uuid) -> Result<Vec<RideRequest>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "SELECT data FROM ride_requests WHERE ride_id = $1
                     ORDER BY (data->>'created_at')::timestamptz ASC",
                )
                .bind(&ride_id),
            )
            .await?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(request): Json<RideRequest> = row.try_get("data")?;
            requests.push(request);
        }

        Ok(requests)
    }

    #[tracing::instrument(skip(self))]
    async fn requests_by_passenger(
        &self,
        passenger_id: &str,
        status: Option<RequestStatus>,
    ) -> Result<Vec<RideRequest>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "SELECT data FROM ride_requests
                     WHERE passenger_id = $1 AND ($2::varchar IS NULL OR status = $2)
                     ORDER BY (data->>'created_at')::timestamptz DESC",
                )
                .bind(passenger_id)
                .bind(status.map(|s| s.name())),
            )
            .await?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(request): Json<RideRequest> = row.try_get("data")?;
            requests.push(request);
        }

        Ok(requests)
    }

    #[tracing::instrument(skip(self))]
    async fn pending_requests_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<RideRequest>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "SELECT rr.data FROM ride_requests rr
                     JOIN rides r ON rr.ride_id = r.id
                     WHERE r.driver_id = $1 AND rr.status = 'PENDING'
                     ORDER BY (rr.data->>'created_at')::timestamptz ASC",
                )
                .bind(driver_id),
            )
            .await?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(request): Json<RideRequest> = row.try_get("data")?;
            requests.push(request);
        }

        Ok(requests)
    }

    #[tracing::instrument(skip(self))]
    async fn pending_requests_near(
        &self,
        center: GeoPoint,
        radius: f64,
    ) -> Result<Vec<RideRequest>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "SELECT data FROM ride_requests
                     WHERE status = 'PENDING'
                       AND pickup_point IS NOT NULL
                       AND ST_DWithin(pickup_point::geography, ST_SetSRID($1, 4326)::geography, $2)",
                )
                .bind(point_geom(center))
                .bind(radius),
            )
            .await?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(request): Json<RideRequest> = row.try_get("data")?;
            requests.push(request);
        }

        Ok(requests)
    }

    #[tracing::instrument(skip(self))]
    async fn transition_request(
        &self,
        id: Uuid,
        event: RequestEvent,
    ) -> Result<TransitionOutcome, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        // Row locks span the whole read-check-write-cascade sequence; an
        // error before commit rolls everything back.
        let mut request = fetch_request_for_update(&mut tx, &id).await?;

        let outcome = match event {
            RequestEvent::Accept {
                reject_pending_when_full,
            } => {
                request.accept()?;

                let mut ride = fetch_ride_for_update(&mut tx, &request.ride_id).await?;
                let remaining = ride.reserve_seats(request.seats_needed)?;
                update_ride_row(&mut tx, &ride).await?;

                let mut auto_rejected = Vec::new();
                if remaining == 0 && reject_pending_when_full {
                    let rows = tx
                        .fetch_all(
                            sqlx::query(
                                "SELECT data FROM ride_requests
                                 WHERE ride_id = $1 AND status = 'PENDING' AND id <> $2
                                 FOR UPDATE",
                            )
                            .bind(&request.ride_id)
                            .bind(&id),
                        )
                        .await?;

                    for row in rows {
                        let Json(mut other): Json<RideRequest> = row.try_get("data")?;
                        other.reject()?;
                        update_request_row(&mut tx, &other).await?;
                        auto_rejected.push(other);
                    }
                }

                TransitionOutcome {
                    request: request.clone(),
                    remaining_seats: Some(remaining),
                    auto_rejected,
                }
            }
            RequestEvent::Reject => {
                request.reject()?;
                TransitionOutcome {
                    request: request.clone(),
                    remaining_seats: None,
                    auto_rejected: Vec::new(),
                }
            }
            RequestEvent::Cancel => {
                let held_seats = request.cancel()?;

                let remaining = if held_seats {
                    let mut ride = fetch_ride_for_update(&mut tx, &request.ride_id).await?;
                    let remaining = ride.release_seats(request.seats_needed);
                    update_ride_row(&mut tx, &ride).await?;
                    Some(remaining)
                } else {
                    None
                };

                TransitionOutcome {
                    request: request.clone(),
                    remaining_seats: remaining,
                    auto_rejected: Vec::new(),
                }
            }
            RequestEvent::Pickup => {
                request.pickup()?;
                TransitionOutcome {
                    request: request.clone(),
                    remaining_seats: None,
                    auto_rejected: Vec::new(),
                }
            }
            RequestEvent::Dropoff => {
                request.dropoff()?;
                TransitionOutcome {
                    request: request.clone(),
                    remaining_seats: None,
                    auto_rejected: Vec::new(),
                }
            }
        };

        update_request_row(&mut tx, &request).await?;

        tx.commit().await?;

        Ok(outcome)
    }

    #[tracing::instrument(skip(self, route))]
    async fn route_market_stats(
        &self,
        route: &Route,
        buffer: f64,
        since: DateTime<Utc>,
    ) -> Result<MarketStats, Error> {
        let mut conn = self.pool.acquire().await?;

        let row = conn
            .fetch_one(
                sqlx::query(
                    "SELECT AVG(price_per_seat)::float8 AS avg_price, COUNT(*)::int8 AS competitor_count
                     FROM rides
                     WHERE planned_route IS NOT NULL
                       AND ST_Length(planned_route) > 0
                       AND ST_DWithin(planned_route::geography, ST_SetSRID($1, 4326)::geography, $2)
                       AND departure_time >= $3",
                )
                .bind(route_geom(route))
                .bind(buffer)
                .bind(since),
            )
            .await?;

        let avg_price: Option<f64> = row.try_get("avg_price")?;
        let competitor_count: i64 = row.try_get("competitor_count")?;

        Ok(MarketStats {
            avg_price,
            competitor_count: competitor_count as u64,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn popular_routes(
        &self,
        center: GeoPoint,
        radius: f64,
        limit: usize,
    ) -> Result<Vec<PopularRoute>, Error> {
        let query = "
            SELECT
                data->'start'->>'address' AS start_address,
                data->'end'->>'address' AS end_address,
                COUNT(*)::int8 AS ride_count,
                AVG(price_per_seat)::float8 AS avg_price,
                AVG((data->>'estimated_duration')::float8)::float8 AS avg_duration,
                AVG((data->>'estimated_distance')::float8)::float8 AS avg_distance,
                MAX((data->>'created_at')::timestamptz) AS last_ride_at
            FROM rides
            WHERE ST_DWithin(start_point::geography, ST_SetSRID($1, 4326)::geography, $2)
            GROUP BY 1, 2
            ORDER BY ride_count DESC
            LIMIT $3
        ";

        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(query)
                    .bind(point_geom(center))
                    .bind(radius)
                    .bind(limit as i64),
            )
            .await?;

        let mut routes = Vec::with_capacity(rows.len());
        for row in rows {
            let ride_count: i64 = row.try_get("ride_count")?;

            routes.push(PopularRoute {
                start_address: row.try_get("start_address")?,
                end_address: row.try_get("end_address")?,
                ride_count: ride_count as u64,
                avg_price: row.try_get("avg_price")?,
                avg_duration: row.try_get("avg_duration")?,
                avg_distance: row.try_get("avg_distance")?,
                last_ride_at: row.try_get("last_ride_at")?,
            });
        }

        Ok(routes)
    }

    #[tracing::instrument(skip(self))]
    async fn density_grid(
        &self,
        bounds: BoundingBox,
        cell_size_deg: f64,
    ) -> Result<Vec<DensityCell>, Error> {
        let query = "
            SELECT
                ST_X(cell)::float8 AS cell_lng,
                ST_Y(cell)::float8 AS cell_lat,
                COUNT(*)::int8 AS ride_count,
                AVG(price_per_seat)::float8 AS avg_price
            FROM (
                SELECT ST_SnapToGrid(start_point, $5) AS cell, price_per_seat
                FROM rides
                WHERE ST_Within(start_point, ST_MakeEnvelope($1, $2, $3, $4, 4326))
            ) AS snapped
            GROUP BY cell
            ORDER BY ride_count DESC
        ";

        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(query)
                    .bind(bounds.min_lng)
                    .bind(bounds.min_lat)
                    .bind(bounds.max_lng)
                    .bind(bounds.max_lat)
                    .bind(cell_size_deg),
            )
            .await?;

        let mut cells = Vec::with_capacity(rows.len());
        for row in rows {
            let min_lng: f64 = row.try_get("cell_lng")?;
            let min_lat: f64 = row.try_get("cell_lat")?;
            let ride_count: i64 = row.try_get("ride_count")?;

            cells.push(DensityCell {
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
                ride_count: ride_count as u64,
                avg_price: row.try_get("avg_price")?,
            });
        }

        Ok(cells)
    }

    #[tracing::instrument(skip(self))]
    async fn request_statistics(
        &self,
        ride_id: Option<Uuid>,
        passenger_id: Option<&str>,
    ) -> Result<Vec<StatusStatistics>, Error> {
        let query = "
            SELECT
                status,
                COUNT(*)::int8 AS count,
                AVG(
                    EXTRACT(EPOCH FROM (
                        (data->>'responded_at')::timestamptz - (data->>'created_at')::timestamptz
                    )) / 60.0
                )::float8 AS avg_response_minutes
            FROM ride_requests
            WHERE ($1::uuid IS NULL OR ride_id = $1)
              AND ($2::varchar IS NULL OR passenger_id = $2)
            GROUP BY status
            ORDER BY count DESC
        ";

        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(sqlx::query(query).bind(ride_id).bind(passenger_id))
            .await?;

        let mut statistics = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;

            statistics.push(StatusStatistics {
                status: parse_status(&status)?,
                count: count as u64,
                avg_response_minutes: row.try_get("avg_response_minutes")?,
            });
        }

        Ok(statistics)
    }
}
