//! Shared types for the geofence presence service

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Newtype wrapper for ParkITESO user IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(UserId)
    }
}

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Raw location sample as received from a client
///
/// Every field is optional so that a missing field is reported as a
/// validation error instead of a deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl LocationUpdate {
    pub fn new(user_id: UserId, latitude: f64, longitude: f64) -> Self {
        Self { user_id: Some(user_id), latitude: Some(latitude), longitude: Some(longitude) }
    }

    /// Check presence and range of every field
    pub fn validate(&self) -> Result<LocationSample, LocationError> {
        let user_id = self.user_id.ok_or(LocationError::MissingUserId)?;
        let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) else {
            return Err(LocationError::MissingCoordinates);
        };

        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(LocationError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(LocationError::InvalidLongitude(longitude));
        }

        Ok(LocationSample { user_id, position: Coordinate::new(latitude, longitude) })
    }
}

/// Validated location sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub user_id: UserId,
    pub position: Coordinate,
}

/// Input rejected before any presence state is touched
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("userId is required")]
    MissingUserId,
    #[error("No coordinates")]
    MissingCoordinates,
    #[error("latitude out of range: {0}")]
    InvalidLatitude(f64),
    #[error("longitude out of range: {0}")]
    InvalidLongitude(f64),
}

/// Result of applying one accepted location sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// User came back inside before the countdown elapsed; checkout cancelled
    ReturnedInside,
    /// Departure detected, countdown armed
    Armed,
    /// Pending countdown restarted from now (sliding deadline policy only)
    Extended,
    /// Nothing to do
    NoChange,
}

impl UpdateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::ReturnedInside => "returned_inside",
            UpdateOutcome::Armed => "armed",
            UpdateOutcome::Extended => "extended",
            UpdateOutcome::NoChange => "no_change",
        }
    }
}

/// Externally visible presence state for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Inside,
    OutsidePending { remaining: Duration },
    OutsideFired,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Inside => "inside",
            PresenceStatus::OutsidePending { .. } => "outside_pending",
            PresenceStatus::OutsideFired => "outside_fired",
        }
    }
}

/// How repeated "still outside" samples affect an armed countdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlinePolicy {
    /// The first departure sample sets the deadline; later ones never move it
    #[default]
    Fixed,
    /// Every outside sample restarts the countdown
    Sliding,
}

impl DeadlinePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlinePolicy::Fixed => "fixed",
            DeadlinePolicy::Sliding => "sliding",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_complete_update() {
        let update = LocationUpdate::new(UserId(1), 20.6075, -103.4105);
        let sample = update.validate().unwrap();
        assert_eq!(sample.user_id, UserId(1));
        assert_eq!(sample.position, Coordinate::new(20.6075, -103.4105));
    }

    #[test]
    fn test_validate_missing_fields() {
        let missing_user = LocationUpdate { user_id: None, latitude: Some(1.0), longitude: Some(1.0) };
        assert_eq!(missing_user.validate(), Err(LocationError::MissingUserId));

        let missing_lon =
            LocationUpdate { user_id: Some(UserId(1)), latitude: Some(1.0), longitude: None };
        assert_eq!(missing_lon.validate(), Err(LocationError::MissingCoordinates));

        assert_eq!(LocationUpdate::default().validate(), Err(LocationError::MissingUserId));
    }

    #[test]
    fn test_validate_zero_is_a_coordinate() {
        let update = LocationUpdate::new(UserId(7), 0.0, 0.0);
        assert!(update.validate().is_ok());
    }

    #[test]
    fn test_validate_out_of_range() {
        let update = LocationUpdate::new(UserId(1), 91.0, 0.0);
        assert!(matches!(update.validate(), Err(LocationError::InvalidLatitude(_))));

        let update = LocationUpdate::new(UserId(1), 0.0, f64::NAN);
        assert!(matches!(update.validate(), Err(LocationError::InvalidLongitude(_))));
    }

    #[test]
    fn test_location_update_from_json() {
        let update: LocationUpdate =
            serde_json::from_str(r#"{"userId": 1, "latitude": 20.605, "longitude": -103.415}"#)
                .unwrap();
        assert_eq!(update.user_id, Some(UserId(1)));
        assert_eq!(update.latitude, Some(20.605));

        let partial: LocationUpdate = serde_json::from_str(r#"{"latitude": 20.605}"#).unwrap();
        assert_eq!(partial.user_id, None);
        assert_eq!(partial.longitude, None);
    }

    #[test]
    fn test_user_id_from_str() {
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), UserId(42));
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(UpdateOutcome::ReturnedInside.as_str(), "returned_inside");
        assert_eq!(serde_json::to_string(&UpdateOutcome::Armed).unwrap(), "\"armed\"");
    }
}
