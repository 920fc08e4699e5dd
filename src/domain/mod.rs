//! Domain models - core types and geofence geometry
//!
//! This module contains the canonical data types used throughout the service:
//! - `UserId` - ParkITESO user identifier
//! - `LocationUpdate` / `LocationSample` - raw and validated location samples
//! - `UpdateOutcome` / `PresenceStatus` - tracker results and snapshots
//! - `Geofence` - static campus polygon with containment test

pub mod geofence;
pub mod types;

pub use geofence::{Geofence, GeofenceError};
pub use types::{
    Coordinate, DeadlinePolicy, LocationError, LocationSample, LocationUpdate, PresenceStatus,
    UpdateOutcome, UserId,
};
