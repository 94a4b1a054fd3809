mod analytics_api;
mod pricing_api;
mod request_api;
mod ride_api;
mod search_api;

use std::sync::Arc;

use crate::api::{Page, API};
use crate::config::Config;
use crate::policy::{CapacityPolicy, DefaultPolicy};
use crate::store::Store;

/// The matching engine. Generic over its store so the same algorithms run
/// against the in-memory store (tests, embedded use) and Postgres.
pub struct Engine<S> {
    store: S,
    config: Config,
    policy: Arc<dyn CapacityPolicy>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, config: Config) -> Self {
        let policy = Arc::new(DefaultPolicy::from_config(&config));

        Self {
            store,
            config,
            policy,
        }
    }

    pub fn with_policy(store: S, config: Config, policy: Arc<dyn CapacityPolicy>) -> Self {
        Self {
            store,
            config,
            policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: Store> API for Engine<S> {}

/// Slices an already-filtered result set; `page` is 1-based.
pub(crate) fn paginate<T>(items: Vec<T>, page: u32, limit: u32) -> Page<T> {
    let total = items.len() as u64;
    let total_pages = ((total + limit as u64 - 1) / limit as u64) as u32;

    let items = items
        .into_iter()
        .skip((page as usize - 1) * limit as usize)
        .take(limit as usize)
        .collect();

    Page {
        items,
        total,
        page,
        total_pages,
    }
}

/// Rounds to cents / hundredths, the precision every price and percentage
/// leaves the engine with.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_math() {
        let page = paginate((0..25).collect::<Vec<_>>(), 2, 10);

        assert_eq!(page.items, (10..20).collect::<Vec<_>>());
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages, 3);

        let past_end = paginate((0..3).collect::<Vec<_>>(), 5, 10);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 3);
    }

    #[test]
    fn rounding() {
        assert_eq!(round2(12.345), 12.35);
        assert_eq!(round3(0.12349), 0.123);
    }
}
