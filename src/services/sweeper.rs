//! Periodic eviction of idle presence entries
//!
//! Without this the presence map grows with every distinct user ever seen.

use crate::services::presence::PresenceTracker;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::info;

/// Shortest sweep period; a zero interval in config means "every second"
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

fn sweep_period(every: Duration) -> Duration {
    every.max(MIN_SWEEP_PERIOD)
}

/// Run `evict_idle` every `every` until shutdown is signalled
pub async fn run_sweeper(
    tracker: PresenceTracker,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = sweep_period(every);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; nothing is idle yet
    ticker.tick().await;

    info!(interval_secs = %period.as_secs(), ttl_secs = %tracker.settings().idle_ttl.as_secs(), "presence_sweeper_started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracker.evict_idle(Instant::now());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("presence_sweeper_shutdown");
                    return;
                }
            }
        }
    }
}
