//! Capacity and detour policy.
//!
//! Two engine behaviors are business policy rather than state-machine law:
//! what happens to a ride's remaining pending requests when an accept takes
//! the last seat, and whether a computed detour is large enough to refuse a
//! request outright. They sit behind this trait so deployments can swap
//! them without touching the request state machine.

use std::fmt::Debug;

use crate::config::Config;

pub trait CapacityPolicy: Send + Sync + Debug {
    /// Bulk-reject a ride's other pending requests once an accept leaves
    /// zero seats.
    fn reject_pending_when_full(&self) -> bool;

    /// Engine-wide ceiling on `detour_percentage` for new requests; `None`
    /// records the detour without limiting it. A limit supplied on the
    /// request itself always takes precedence.
    fn max_detour_percentage(&self) -> Option<f64>;
}

#[derive(Clone, Debug)]
pub struct DefaultPolicy {
    reject_pending_when_full: bool,
    max_detour_percentage: Option<f64>,
}

impl DefaultPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reject_pending_when_full: config.reject_pending_when_full,
            max_detour_percentage: config.max_detour_percentage,
        }
    }
}

impl CapacityPolicy for DefaultPolicy {
    fn reject_pending_when_full(&self) -> bool {
        self.reject_pending_when_full
    }

    fn max_detour_percentage(&self) -> Option<f64> {
        self.max_detour_percentage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_mirrors_config() {
        let mut config = Config::default();
        config.max_detour_percentage = Some(35.0);
        config.reject_pending_when_full = false;

        let policy = DefaultPolicy::from_config(&config);
        assert!(!policy.reject_pending_when_full());
        assert_eq!(policy.max_detour_percentage(), Some(35.0));
    }
}
