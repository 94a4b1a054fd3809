use std::env;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};

/// Engine configuration. Every knob has a default; `from_env` overrides
/// from `VECTO_*` environment variables so deployments can tune pricing and
/// policy without a rebuild.
#[derive(Clone, Debug)]
pub struct Config {
    /// Flat component of every price suggestion.
    pub base_fare: f64,
    /// Price per kilometer of route length.
    pub per_km_rate: f64,
    /// Flat surcharge applied inside a peak window.
    pub peak_surcharge: f64,
    /// Inclusive hour ranges (UTC) that count as peak traffic.
    pub peak_windows: Vec<(u32, u32)>,
    /// Buffer in meters around a route when sampling the market.
    pub market_buffer: f64,
    /// Trailing window for market analysis, days.
    pub market_window_days: i64,
    /// Average price reported when the market query fails or finds nothing.
    pub market_fallback_avg_price: f64,
    /// Competitor counts above these bounds classify as medium/high demand.
    pub demand_medium_threshold: u64,
    pub demand_high_threshold: u64,
    /// Default walking budget for the pickup/dropoff solver, kilometers.
    pub default_max_detour_km: f64,
    /// When an accept exhausts a ride's seats, bulk-reject its remaining
    /// pending requests.
    pub reject_pending_when_full: bool,
    /// Engine-wide detour ceiling in percent; `None` records detours
    /// without limiting them.
    pub max_detour_percentage: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_fare: 15.0,
            per_km_rate: 2.5,
            peak_surcharge: 5.0,
            peak_windows: vec![(7, 9), (17, 19)],
            market_buffer: 2000.0,
            market_window_days: 30,
            market_fallback_avg_price: 25.0,
            demand_medium_threshold: 2,
            demand_high_threshold: 5,
            default_max_detour_km: 2.0,
            reject_pending_when_full: true,
            max_detour_percentage: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            base_fare: env_parsed("VECTO_BASE_FARE", defaults.base_fare),
            per_km_rate: env_parsed("VECTO_PER_KM_RATE", defaults.per_km_rate),
            peak_surcharge: env_parsed("VECTO_PEAK_SURCHARGE", defaults.peak_surcharge),
            peak_windows: env_windows("VECTO_PEAK_WINDOWS", defaults.peak_windows),
            market_buffer: env_parsed("VECTO_MARKET_BUFFER_M", defaults.market_buffer),
            market_window_days: env_parsed(
                "VECTO_MARKET_WINDOW_DAYS",
                defaults.market_window_days,
            ),
            market_fallback_avg_price: env_parsed(
                "VECTO_MARKET_FALLBACK_AVG_PRICE",
                defaults.market_fallback_avg_price,
            ),
            demand_medium_threshold: env_parsed(
                "VECTO_DEMAND_MEDIUM_THRESHOLD",
                defaults.demand_medium_threshold,
            ),
            demand_high_threshold: env_parsed(
                "VECTO_DEMAND_HIGH_THRESHOLD",
                defaults.demand_high_threshold,
            ),
            default_max_detour_km: env_parsed(
                "VECTO_DEFAULT_MAX_DETOUR_KM",
                defaults.default_max_detour_km,
            ),
            reject_pending_when_full: env_parsed(
                "VECTO_REJECT_PENDING_WHEN_FULL",
                defaults.reject_pending_when_full,
            ),
            max_detour_percentage: env::var("VECTO_MAX_DETOUR_PERCENTAGE")
                .ok()
                .and_then(|raw| raw.parse().ok()),
        }
    }

    pub fn is_peak(&self, t: DateTime<Utc>) -> bool {
        let hour = t.hour();
        self.peak_windows
            .iter()
            .any(|(from, to)| hour >= *from && hour <= *to)
    }
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parses window lists of the form "7-9,17-19".
fn env_windows(key: &str, default: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    let Ok(raw) = env::var(key) else {
        return default;
    };

    let parsed: Option<Vec<(u32, u32)>> = raw
        .split(',')
        .map(|window| {
            let (from, to) = window.trim().split_once('-')?;
            Some((from.parse().ok()?, to.parse().ok()?))
        })
        .collect();

    parsed.unwrap_or(default)
}
