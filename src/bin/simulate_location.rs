//! Location sample sender
//!
//! Posts location samples to a running geofence service, the same way the
//! mobile app does, then prints the user's presence state.
//!
//! Usage:
//!   cargo run --bin simulate_location                          # one sample off campus for user 1
//!   cargo run --bin simulate_location -- --user 7 --lat 20.6075 --lon -103.4105
//!   cargo run --bin simulate_location -- --count 10 --interval-ms 2000

use clap::Parser;
use serde::Serialize;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "simulate_location")]
#[command(about = "Send location samples to the geofence service")]
struct Args {
    /// Location endpoint
    #[arg(long, default_value = "http://localhost:3000/location")]
    url: String,

    /// User id to report for
    #[arg(short, long, default_value = "1")]
    user: i64,

    /// Latitude (default is just outside the campus polygon)
    #[arg(long, default_value = "20.6050", allow_hyphen_values = true)]
    lat: f64,

    /// Longitude
    #[arg(long, default_value = "-103.4150", allow_hyphen_values = true)]
    lon: f64,

    /// Number of samples to send
    #[arg(short, long, default_value = "1")]
    count: u32,

    /// Delay between samples (ms)
    #[arg(long, default_value = "1000")]
    interval_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Sample {
    user_id: i64,
    latitude: f64,
    longitude: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;

    let sample = Sample { user_id: args.user, latitude: args.lat, longitude: args.lon };

    for i in 0..args.count {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }

        match client.post(&args.url).json(&sample).send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                println!("[SIM] #{} user={} ({}, {}) -> {} {}", i + 1, args.user, args.lat, args.lon, status.as_u16(), body);
            }
            Err(e) => {
                eprintln!("[SIM] Failed to send location: {}", e);
            }
        }
    }

    // Presence lives next to /location on the same server
    let presence_url = match args.url.strip_suffix("/location") {
        Some(base) => format!("{}/presence/{}", base, args.user),
        None => return Ok(()),
    };
    match client.get(&presence_url).send().await {
        Ok(resp) => println!("[SIM] Presence: {}", resp.text().await.unwrap_or_default()),
        Err(e) => eprintln!("[SIM] Failed to read presence: {}", e),
    }

    Ok(())
}
