//! Per-user geofence presence and delayed automatic checkout
//!
//! Every user is in one of three states:
//! - `Inside` - last sample was inside the campus polygon (default for unseen users)
//! - `OutsidePending` - user left, a countdown to checkout is armed
//! - `OutsideFired` - countdown elapsed and the checkout was dispatched
//!
//! State lives in a sharded map. Each shard is a `parking_lot::Mutex` and the
//! read-decide-write of an update (including arming or cancelling a countdown)
//! happens under that lock. A countdown is a tokio task that sleeps until its
//! deadline, then takes the same lock and fires only if its sequence number is
//! still the pending one. The checkout call itself runs after the lock is
//! released.

#[cfg(test)]
mod tests;

use crate::domain::geofence::Geofence;
use crate::domain::types::{
    Coordinate, DeadlinePolicy, LocationError, LocationSample, LocationUpdate, PresenceStatus,
    UpdateOutcome, UserId,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::checkout::{CheckoutError, CheckoutService};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::hash_map::Entry;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of independently locked shards in the presence map
const SHARD_COUNT: usize = 16;

/// Tunables for the presence state machine
#[derive(Debug, Clone, Copy)]
pub struct PresenceSettings {
    /// How long a user may stay outside before the checkout fires
    pub checkout_delay: Duration,
    pub deadline_policy: DeadlinePolicy,
    /// Idle entries older than this are removed by `evict_idle`
    pub idle_ttl: Duration,
}

impl PresenceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            checkout_delay: config.checkout_delay(),
            deadline_policy: config.deadline_policy(),
            idle_ttl: config.idle_ttl(),
        }
    }
}

/// Handle to an armed countdown
#[derive(Debug)]
struct PendingCheckout {
    seq: u64,
    deadline: Instant,
    abort: AbortHandle,
}

#[derive(Debug)]
enum Presence {
    Inside,
    OutsidePending(PendingCheckout),
    OutsideFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresenceKind {
    Inside,
    Pending,
    Fired,
}

impl Presence {
    fn kind(&self) -> PresenceKind {
        match self {
            Presence::Inside => PresenceKind::Inside,
            Presence::OutsidePending(_) => PresenceKind::Pending,
            Presence::OutsideFired => PresenceKind::Fired,
        }
    }
}

#[derive(Debug)]
struct PresenceEntry {
    presence: Presence,
    last_seen: Instant,
}

impl PresenceEntry {
    /// Unseen users are assumed to be on campus
    fn new(now: Instant) -> Self {
        Self { presence: Presence::Inside, last_seen: now }
    }
}

type Shard = Mutex<FxHashMap<UserId, PresenceEntry>>;

struct Shared {
    geofence: Geofence,
    settings: PresenceSettings,
    checkout: Arc<dyn CheckoutService>,
    metrics: Arc<Metrics>,
    shards: Box<[Shard]>,
    next_seq: AtomicU64,
    /// Number of entries across all shards
    tracked: AtomicU64,
    /// Number of `OutsidePending` entries across all shards
    pending: AtomicU64,
}

/// Geofence presence tracker
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Shared>,
}

impl PresenceTracker {
    pub fn new(
        geofence: Geofence,
        settings: PresenceSettings,
        checkout: Arc<dyn CheckoutService>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(FxHashMap::default())).collect();
        Self {
            inner: Arc::new(Shared {
                geofence,
                settings,
                checkout,
                metrics,
                shards,
                next_seq: AtomicU64::new(1),
                tracked: AtomicU64::new(0),
                pending: AtomicU64::new(0),
            }),
        }
    }

    /// Apply one location sample
    ///
    /// Must be called from within a tokio runtime: arming a countdown spawns a task.
    pub fn update_location(&self, update: &LocationUpdate) -> Result<UpdateOutcome, LocationError> {
        let start = std::time::Instant::now();

        let sample = match update.validate() {
            Ok(sample) => sample,
            Err(e) => {
                self.inner.metrics.record_invalid_update();
                debug!(error = %e, "location_rejected");
                return Err(e);
            }
        };

        let outcome = self.apply(sample);

        let latency_us = start.elapsed().as_micros() as u64;
        self.inner.metrics.record_update(latency_us);
        Ok(outcome)
    }

    /// Whether a position is inside the campus polygon
    pub fn contains(&self, position: Coordinate) -> bool {
        self.inner.geofence.contains(position)
    }

    /// Current state of a user; unseen users report `Inside`
    pub fn status(&self, user_id: UserId) -> PresenceStatus {
        let shard = self.shard(user_id).lock();
        match shard.get(&user_id).map(|e| &e.presence) {
            None | Some(Presence::Inside) => PresenceStatus::Inside,
            Some(Presence::OutsidePending(pending)) => PresenceStatus::OutsidePending {
                remaining: pending.deadline.saturating_duration_since(Instant::now()),
            },
            Some(Presence::OutsideFired) => PresenceStatus::OutsideFired,
        }
    }

    pub fn tracked_users(&self) -> u64 {
        self.inner.tracked.load(Ordering::Relaxed)
    }

    pub fn pending_checkouts(&self) -> u64 {
        self.inner.pending.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.inner.settings
    }

    /// Remove entries idle for longer than the TTL
    ///
    /// Entries with an armed countdown are kept; the countdown owns them until
    /// it fires or is cancelled. Returns the number of evicted users.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.inner.settings.idle_ttl;
        let mut evicted = 0;

        for shard in self.inner.shards.iter() {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, entry| {
                matches!(entry.presence, Presence::OutsidePending(_))
                    || now.saturating_duration_since(entry.last_seen) < ttl
            });
            let removed = before - map.len();
            if removed > 0 {
                self.untrack(removed as u64);
            }
            evicted += removed;
        }

        if evicted > 0 {
            self.inner.metrics.record_evicted(evicted as u64);
            info!(evicted = %evicted, tracked = %self.tracked_users(), "presence_evicted");
        }
        self.publish_gauges();
        evicted
    }

    /// Abort every armed countdown and drop all presence state
    pub fn shutdown(&self) -> usize {
        let mut aborted = 0;

        for shard in self.inner.shards.iter() {
            let mut map = shard.lock();
            let mut shard_aborted = 0u64;
            let removed = map.len() as u64;
            for (_, entry) in map.drain() {
                if let Presence::OutsidePending(pending) = entry.presence {
                    pending.abort.abort();
                    shard_aborted += 1;
                }
            }
            self.untrack(removed);
            self.inner.pending.fetch_sub(shard_aborted, Ordering::Relaxed);
            aborted += shard_aborted as usize;
        }

        self.publish_gauges();
        info!(aborted = %aborted, "presence_shutdown");
        aborted
    }

    fn shard(&self, user_id: UserId) -> &Shard {
        let mut hasher = FxHasher::default();
        user_id.hash(&mut hasher);
        &self.inner.shards[hasher.finish() as usize % self.inner.shards.len()]
    }

    /// Drop `count` entries from the tracked gauge; caller holds the shard lock they came from
    fn untrack(&self, count: u64) {
        let _ = self.inner.tracked.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(count))
        });
    }

    fn publish_gauges(&self) {
        self.inner.metrics.set_tracked_users(self.tracked_users());
        self.inner.metrics.set_pending_checkouts(self.pending_checkouts());
    }

    /// State transition for a validated sample, atomic per user
    fn apply(&self, sample: LocationSample) -> UpdateOutcome {
        let user_id = sample.user_id;
        let inside = self.inner.geofence.contains(sample.position);
        let now = Instant::now();

        let (outcome, deadline) = {
            let mut shard = self.shard(user_id).lock();
            let entry = match shard.entry(user_id) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    self.inner.tracked.fetch_add(1, Ordering::Relaxed);
                    vacant.insert(PresenceEntry::new(now))
                }
            };
            entry.last_seen = now;

            match (inside, entry.presence.kind()) {
                (true, PresenceKind::Inside) => (UpdateOutcome::NoChange, None),
                (true, PresenceKind::Fired) => {
                    entry.presence = Presence::Inside;
                    (UpdateOutcome::NoChange, None)
                }
                (true, PresenceKind::Pending) => {
                    self.cancel(std::mem::replace(&mut entry.presence, Presence::Inside));
                    (UpdateOutcome::ReturnedInside, None)
                }
                (false, PresenceKind::Inside) => {
                    let pending = self.arm(user_id, now);
                    let deadline = pending.deadline;
                    entry.presence = Presence::OutsidePending(pending);
                    (UpdateOutcome::Armed, Some(deadline))
                }
                (false, PresenceKind::Pending) => match self.inner.settings.deadline_policy {
                    DeadlinePolicy::Fixed => (UpdateOutcome::NoChange, None),
                    DeadlinePolicy::Sliding => {
                        let pending = self.arm(user_id, now);
                        let deadline = pending.deadline;
                        self.cancel(std::mem::replace(
                            &mut entry.presence,
                            Presence::OutsidePending(pending),
                        ));
                        (UpdateOutcome::Extended, Some(deadline))
                    }
                },
                // Already checked out; wait for the user to come back first
                (false, PresenceKind::Fired) => (UpdateOutcome::NoChange, None),
            }
        };

        match outcome {
            UpdateOutcome::Armed => {
                self.inner.metrics.record_armed();
                info!(
                    user_id = %user_id,
                    lat = %sample.position.latitude,
                    lon = %sample.position.longitude,
                    delay_ms = %self.inner.settings.checkout_delay.as_millis(),
                    "presence_armed"
                );
            }
            UpdateOutcome::ReturnedInside => {
                self.inner.metrics.record_returned();
                info!(user_id = %user_id, "presence_returned");
            }
            UpdateOutcome::Extended => {
                self.inner.metrics.record_extended();
                debug!(
                    user_id = %user_id,
                    remaining_ms = ?deadline.map(|d| d.saturating_duration_since(now).as_millis()),
                    "presence_extended"
                );
            }
            UpdateOutcome::NoChange => {
                debug!(user_id = %user_id, inside = %inside, "presence_unchanged");
            }
        }

        self.publish_gauges();
        outcome
    }

    /// Spawn a countdown task; caller holds the user's shard lock
    fn arm(&self, user_id: UserId, now: Instant) -> PendingCheckout {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = now + self.inner.settings.checkout_delay;

        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            tracker.run_countdown(user_id, seq, deadline).await;
        });

        self.inner.pending.fetch_add(1, Ordering::Relaxed);
        PendingCheckout { seq, deadline, abort: handle.abort_handle() }
    }

    /// Cancel a countdown that is being replaced; caller holds the shard lock
    fn cancel(&self, previous: Presence) {
        if let Presence::OutsidePending(pending) = previous {
            pending.abort.abort();
            self.inner.pending.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Mark the countdown `seq` as fired if it is still the pending one
    fn take_due(&self, user_id: UserId, seq: u64) -> bool {
        let mut shard = self.shard(user_id).lock();
        let Some(entry) = shard.get_mut(&user_id) else {
            return false;
        };

        match &entry.presence {
            Presence::OutsidePending(pending) if pending.seq == seq => {
                entry.presence = Presence::OutsideFired;
                self.inner.pending.fetch_sub(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    async fn run_countdown(self, user_id: UserId, seq: u64, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;

        if !self.take_due(user_id, seq) {
            debug!(user_id = %user_id, seq = %seq, "presence_countdown_stale");
            return;
        }

        self.inner.metrics.record_fired();
        self.publish_gauges();
        info!(user_id = %user_id, seq = %seq, "presence_checkout_fired");

        let start = std::time::Instant::now();
        let result = self.inner.checkout.checkout(user_id).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        self.inner.metrics.record_checkout(result.is_ok(), latency_ms);

        match result {
            Ok(()) => {
                info!(user_id = %user_id, latency_ms = %latency_ms, "checkout_completed");
            }
            Err(CheckoutError::Rejected { status, message }) => {
                info!(
                    user_id = %user_id,
                    status = %status,
                    message = %message,
                    latency_ms = %latency_ms,
                    "checkout_rejected"
                );
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, latency_ms = %latency_ms, "checkout_failed");
            }
        }
    }
}
