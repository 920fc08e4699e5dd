//! IO modules - external system interfaces
//!
//! - `api` - HTTP ingress for location samples and presence queries
//! - `prometheus` - Prometheus text exposition served by the API

pub mod api;
pub mod prometheus;

pub use api::{start_api_server, ApiState};
