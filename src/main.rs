//! ParkITESO geofence service
//!
//! Receives location samples from the mobile app, tracks whether each user is
//! inside the campus polygon, and checks a user out automatically once they
//! have stayed outside for the configured delay.
//!
//! Module structure:
//! - `domain/` - Core types (UserId, Coordinate, Geofence)
//! - `io/` - External interfaces (location API, Prometheus text)
//! - `services/` - Business logic (PresenceTracker, checkout client, sweeper)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use parkiteso_geofence::infra::{Config, Metrics};
use parkiteso_geofence::io::{start_api_server, ApiState};
use parkiteso_geofence::services::{run_sweeper, HttpCheckout, PresenceSettings, PresenceTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// ParkITESO geofence - automatic checkout when users leave campus
#[derive(Parser, Debug)]
#[command(name = "parkiteso-geofence", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-sample decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), "parkiteso-geofence starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        bind = %config.bind_address(),
        port = %config.server_port(),
        vertices = %config.geofence().vertices().len(),
        checkout_delay_secs = %config.checkout_delay().as_secs(),
        deadline_policy = %config.deadline_policy().as_str(),
        checkout_url = %config.checkout_url(),
        idle_ttl_secs = %config.idle_ttl().as_secs(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let checkout = HttpCheckout::new(&config)?;
    let tracker = PresenceTracker::new(
        config.geofence().clone(),
        PresenceSettings::from_config(&config),
        Arc::new(checkout),
        metrics.clone(),
    );

    // Start idle-entry sweeper
    let sweeper_tracker = tracker.clone();
    let sweep_every = Duration::from_secs(config.sweep_interval_secs());
    let sweeper_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        run_sweeper(sweeper_tracker, sweep_every, sweeper_shutdown).await;
    });

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval.max(1)));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    let state = ApiState {
        tracker: tracker.clone(),
        metrics,
        site_id: Arc::from(config.site_id()),
    };

    // Serve until shutdown
    if let Err(e) = start_api_server(config.bind_address(), config.server_port(), state, shutdown_rx).await {
        tracing::error!(error = %e, "api_server_error");
    }

    let aborted = tracker.shutdown();
    info!(aborted_countdowns = %aborted, "parkiteso-geofence shutdown complete");
    Ok(())
}
