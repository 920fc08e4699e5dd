//! Configuration loading from TOML files
//!
//! The binary selects the config file via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::geofence::Geofence;
use crate::domain::types::{Coordinate, DeadlinePolicy};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Rough outline of the ITESO campus, used when no config file is available
const DEFAULT_CAMPUS: [[f64; 2]; 4] =
    [[20.6105, -103.4175], [20.6100, -103.4075], [20.6058, -103.4082], [20.6062, -103.4168]];

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "parkiteso".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_server_port() }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    /// Ordered `[lat, lon]` vertices, closed implicitly
    pub vertices: Vec<[f64; 2]>,
    /// Time a user may stay outside before the automatic checkout fires
    pub checkout_delay_secs: u64,
    #[serde(default)]
    pub deadline_policy: DeadlinePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutConfig {
    pub url: String,
    #[serde(default = "default_checkout_timeout_ms")]
    pub timeout_ms: u64,
    /// Value of the `type` field sent to the checkout service
    #[serde(default = "default_checkout_type")]
    pub checkout_type: String,
}

fn default_checkout_timeout_ms() -> u64 {
    5000
}

fn default_checkout_type() -> String {
    "automatic".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Entries idle longer than this (and not counting down) are evicted
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_idle_ttl_secs() -> u64 {
    12 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub geofence: GeofenceConfig,
    pub checkout: CheckoutConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    bind_address: String,
    server_port: u16,
    geofence: Geofence,
    checkout_delay: Duration,
    deadline_policy: DeadlinePolicy,
    checkout_url: String,
    checkout_timeout_ms: u64,
    checkout_type: String,
    idle_ttl_secs: u64,
    sweep_interval_secs: u64,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            bind_address: default_bind_address(),
            server_port: default_server_port(),
            geofence: Geofence::new_unchecked(
                DEFAULT_CAMPUS.iter().map(|&[lat, lon]| Coordinate::new(lat, lon)).collect(),
            ),
            checkout_delay: Duration::from_secs(300),
            deadline_policy: DeadlinePolicy::Fixed,
            checkout_url: "http://localhost:4000/checkout".to_string(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
            checkout_type: default_checkout_type(),
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let geofence = Geofence::from_pairs(&toml_config.geofence.vertices)
            .with_context(|| format!("Invalid geofence in {}", path.display()))?;

        if toml_config.geofence.checkout_delay_secs == 0 {
            bail!("checkout_delay_secs must be greater than zero in {}", path.display());
        }

        Ok(Self {
            site_id: toml_config.site.id,
            bind_address: toml_config.server.bind_address,
            server_port: toml_config.server.port,
            geofence,
            checkout_delay: Duration::from_secs(toml_config.geofence.checkout_delay_secs),
            deadline_policy: toml_config.geofence.deadline_policy,
            checkout_url: toml_config.checkout.url,
            checkout_timeout_ms: toml_config.checkout.timeout_ms,
            checkout_type: toml_config.checkout.checkout_type,
            idle_ttl_secs: toml_config.presence.idle_ttl_secs,
            sweep_interval_secs: toml_config.presence.sweep_interval_secs,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn geofence(&self) -> &Geofence {
        &self.geofence
    }

    pub fn checkout_delay(&self) -> Duration {
        self.checkout_delay
    }

    pub fn deadline_policy(&self) -> DeadlinePolicy {
        self.deadline_policy
    }

    pub fn checkout_url(&self) -> &str {
        &self.checkout_url
    }

    pub fn checkout_timeout_ms(&self) -> u64 {
        self.checkout_timeout_ms
    }

    pub fn checkout_type(&self) -> &str {
        &self.checkout_type
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval_secs(&self) -> u64 {
        self.sweep_interval_secs
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the checkout delay
    pub fn with_checkout_delay(mut self, delay: Duration) -> Self {
        self.checkout_delay = delay;
        self
    }

    /// Builder method for tests to switch the deadline policy
    pub fn with_deadline_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.deadline_policy = policy;
        self
    }

    /// Builder method for tests to point at a mock checkout service
    pub fn with_checkout_url(mut self, url: &str) -> Self {
        self.checkout_url = url.to_string();
        self
    }
}
