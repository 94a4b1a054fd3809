use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Location;
use crate::error::{invalid_state_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    OnGoing,
    Completed,
}

impl RequestStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::OnGoing => "ON_GOING",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled | Self::Completed)
    }
}

/// One passenger's bid to join a specific ride.
///
/// Detour fields are computed once at creation (when both custom stops are
/// supplied) and kept for later inspection; they never change afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub passenger_id: String,
    pub seats_needed: u32,
    pub message: Option<String>,
    pub requested_pickup: Option<Location>,
    pub requested_dropoff: Option<Location>,
    /// Ride start to requested pickup, meters.
    pub pickup_distance: f64,
    /// Requested dropoff to ride end, meters.
    pub dropoff_distance: f64,
    /// Extra meters the detour adds over the ride's estimated distance.
    pub additional_distance: f64,
    pub detour_percentage: f64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub dropped_off_at: Option<DateTime<Utc>>,
}

impl RideRequest {
    /// Fresh PENDING request with no custom stops; callers fill in message,
    /// stops and detour metrics before persisting.
    pub fn new(ride_id: Uuid, passenger_id: impl Into<String>, seats_needed: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            ride_id,
            passenger_id: passenger_id.into(),
            seats_needed,
            message: None,
            requested_pickup: None,
            requested_dropoff: None,
            pickup_distance: 0.0,
            dropoff_distance: 0.0,
            additional_distance: 0.0,
            detour_percentage: 0.0,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            picked_up_at: None,
            dropped_off_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// Whether this request currently holds seats on its ride.
    pub fn holds_seats(&self) -> bool {
        matches!(self.status, RequestStatus::Accepted | RequestStatus::OnGoing)
    }

    /// Driver approves the request. Seat accounting happens around this
    /// call, inside the store's atomic transition.
    pub fn accept(&mut self) -> Result<(), Error> {
        match self.status {
            RequestStatus::Pending => {
                self.status = RequestStatus::Accepted;
                self.responded_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Driver turns the request down.
    pub fn reject(&mut self) -> Result<(), Error> {
        match self.status {
            RequestStatus::Pending => {
                self.status = RequestStatus::Rejected;
                self.responded_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Passenger withdraws. Returns whether the request held seats that
    /// must go back to the ride.
    pub fn cancel(&mut self) -> Result<bool, Error> {
        match self.status {
            RequestStatus::Pending | RequestStatus::Accepted => {
                let held_seats = self.status == RequestStatus::Accepted;
                self.status = RequestStatus::Cancelled;
                self.responded_at = Some(Utc::now());
                Ok(held_seats)
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Passenger boards.
    pub fn pickup(&mut self) -> Result<(), Error> {
        match self.status {
            RequestStatus::Accepted => {
                self.status = RequestStatus::OnGoing;
                self.picked_up_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Passenger leaves the car at their stop.
    pub fn dropoff(&mut self) -> Result<(), Error> {
        match self.status {
            RequestStatus::OnGoing => {
                self.status = RequestStatus::Completed;
                self.dropped_off_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }
}
