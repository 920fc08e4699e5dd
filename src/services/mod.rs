//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `presence` - Per-user geofence state machine and delayed checkout
//! - `checkout` - Outbound checkout service client
//! - `sweeper` - Periodic eviction of idle presence entries

pub mod checkout;
pub mod presence;
pub mod sweeper;

// Re-export commonly used types
pub use checkout::{CheckoutError, CheckoutService, HttpCheckout};
pub use presence::{PresenceSettings, PresenceTracker};
pub use sweeper::run_sweeper;
