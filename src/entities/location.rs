use serde::{Deserialize, Serialize};

use crate::error::{validation_error, Error};
use crate::geo::GeoPoint;

/// A named geographic position: coordinates plus the human-readable address
/// shown to riders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Location {
    pub address: String,
    pub point: GeoPoint,
}

impl Location {
    pub fn new(address: impl Into<String>, point: GeoPoint) -> Self {
        Self {
            address: address.into(),
            point,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.point.is_valid() {
            return Err(validation_error(format!(
                "invalid coordinates ({}, {})",
                self.point.latitude, self.point.longitude
            )));
        }

        if self.address.trim().is_empty() {
            return Err(validation_error("address must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_coordinates_and_address() {
        assert!(Location::new("Alexanderplatz", GeoPoint::new(52.52, 13.40))
            .validate()
            .is_ok());
        assert!(Location::new("", GeoPoint::new(52.52, 13.40))
            .validate()
            .is_err());
        assert!(Location::new("nowhere", GeoPoint::new(95.0, 13.40))
            .validate()
            .is_err());
    }
}
