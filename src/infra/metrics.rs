//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Checkout call latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000 ms
const CHECKOUT_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Compute bucket index for a value against the given bounds using binary search
#[inline]
fn bucket_index(bounds: &[u64; 10], value: u64) -> usize {
    bounds.partition_point(|&bound| bound < value)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(
    buckets: &[u64; NUM_BUCKETS],
    bounds: &[u64; 10],
    percentile: f64,
) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports 2x the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total accepted location updates (monotonic)
    updates_total: AtomicU64,
    /// Accepted updates since last report (reset on report)
    updates_since_report: AtomicU64,
    /// Sum of update latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max update latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Update processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Updates rejected by validation (monotonic)
    invalid_updates_total: AtomicU64,
    /// Countdowns armed (monotonic)
    armed_total: AtomicU64,
    /// Countdowns cancelled because the user came back (monotonic)
    returned_total: AtomicU64,
    /// Countdowns restarted under the sliding policy (monotonic)
    extended_total: AtomicU64,
    /// Countdowns that elapsed and fired a checkout (monotonic)
    fired_total: AtomicU64,
    /// Checkout calls that succeeded (monotonic)
    checkout_ok_total: AtomicU64,
    /// Checkout calls that failed (monotonic)
    checkout_failed_total: AtomicU64,
    /// Checkout call latency histogram buckets in ms (reset on report)
    checkout_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of checkout latencies in ms (reset on report)
    checkout_latency_sum_ms: AtomicU64,
    /// Checkout calls since last report (reset on report)
    checkouts_since_report: AtomicU64,
    /// Presence entries removed by the idle sweeper (monotonic)
    evicted_total: AtomicU64,
    /// Current presence map size (gauge)
    tracked_users: AtomicU64,
    /// Current armed countdowns (gauge)
    pending_checkouts: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            updates_total: AtomicU64::new(0),
            updates_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            invalid_updates_total: AtomicU64::new(0),
            armed_total: AtomicU64::new(0),
            returned_total: AtomicU64::new(0),
            extended_total: AtomicU64::new(0),
            fired_total: AtomicU64::new(0),
            checkout_ok_total: AtomicU64::new(0),
            checkout_failed_total: AtomicU64::new(0),
            checkout_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            checkout_latency_sum_ms: AtomicU64::new(0),
            checkouts_since_report: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            tracked_users: AtomicU64::new(0),
            pending_checkouts: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an accepted location update with its processing latency
    #[inline]
    pub fn record_update(&self, latency_us: u64) {
        self.updates_total.fetch_add(1, Ordering::Relaxed);
        self.updates_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(&BUCKET_BOUNDS, latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_invalid_update(&self) {
        self.invalid_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_armed(&self) {
        self.armed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_returned(&self) {
        self.returned_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_extended(&self) {
        self.extended_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fired(&self) {
        self.fired_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the result and latency of one checkout call
    #[inline]
    pub fn record_checkout(&self, ok: bool, latency_ms: u64) {
        if ok {
            self.checkout_ok_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkout_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.checkouts_since_report.fetch_add(1, Ordering::Relaxed);
        self.checkout_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let bucket = bucket_index(&CHECKOUT_BOUNDS, latency_ms);
        self.checkout_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evicted(&self, count: u64) {
        self.evicted_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_tracked_users(&self, count: u64) {
        self.tracked_users.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_pending_checkouts(&self, count: u64) {
        self.pending_checkouts.store(count, Ordering::Relaxed);
    }

    pub fn updates_total(&self) -> u64 {
        self.updates_total.load(Ordering::Relaxed)
    }

    pub fn invalid_updates_total(&self) -> u64 {
        self.invalid_updates_total.load(Ordering::Relaxed)
    }

    pub fn armed_total(&self) -> u64 {
        self.armed_total.load(Ordering::Relaxed)
    }

    pub fn returned_total(&self) -> u64 {
        self.returned_total.load(Ordering::Relaxed)
    }

    pub fn fired_total(&self) -> u64 {
        self.fired_total.load(Ordering::Relaxed)
    }

    pub fn checkout_ok_total(&self) -> u64 {
        self.checkout_ok_total.load(Ordering::Relaxed)
    }

    pub fn checkout_failed_total(&self) -> u64 {
        self.checkout_failed_total.load(Ordering::Relaxed)
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let updates_count = self.updates_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let checkout_count = self.checkouts_since_report.swap(0, Ordering::Relaxed);
        let checkout_sum = self.checkout_latency_sum_ms.swap(0, Ordering::Relaxed);
        let checkout_lat_buckets = swap_buckets(&self.checkout_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let updates_per_sec = if elapsed.as_secs_f64() > 0.0 {
            updates_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            updates_total: self.updates_total.load(Ordering::Relaxed),
            updates_per_sec,
            avg_update_latency_us: if updates_count > 0 { latency_sum / updates_count } else { 0 },
            max_update_latency_us: max_latency,
            update_lat_sum_us: latency_sum,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, &BUCKET_BOUNDS, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, &BUCKET_BOUNDS, 0.99),
            invalid_updates_total: self.invalid_updates_total.load(Ordering::Relaxed),
            armed_total: self.armed_total.load(Ordering::Relaxed),
            returned_total: self.returned_total.load(Ordering::Relaxed),
            extended_total: self.extended_total.load(Ordering::Relaxed),
            fired_total: self.fired_total.load(Ordering::Relaxed),
            checkout_ok_total: self.checkout_ok_total.load(Ordering::Relaxed),
            checkout_failed_total: self.checkout_failed_total.load(Ordering::Relaxed),
            checkout_lat_buckets,
            checkout_lat_avg_ms: if checkout_count > 0 { checkout_sum / checkout_count } else { 0 },
            checkout_lat_sum_ms: checkout_sum,
            checkout_lat_p99_ms: percentile_from_buckets(
                &checkout_lat_buckets,
                &CHECKOUT_BOUNDS,
                0.99,
            ),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            tracked_users: self.tracked_users.load(Ordering::Relaxed),
            pending_checkouts: self.pending_checkouts.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_CHECKOUT_BOUNDS: [u64; 10] = CHECKOUT_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub updates_total: u64,
    pub updates_per_sec: f64,
    pub avg_update_latency_us: u64,
    pub max_update_latency_us: u64,
    pub update_lat_sum_us: u64,
    /// Update processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub invalid_updates_total: u64,
    pub armed_total: u64,
    pub returned_total: u64,
    pub extended_total: u64,
    pub fired_total: u64,
    pub checkout_ok_total: u64,
    pub checkout_failed_total: u64,
    /// Checkout call latency histogram buckets (ms)
    pub checkout_lat_buckets: [u64; NUM_BUCKETS],
    pub checkout_lat_avg_ms: u64,
    pub checkout_lat_sum_ms: u64,
    pub checkout_lat_p99_ms: u64,
    pub evicted_total: u64,
    pub tracked_users: u64,
    pub pending_checkouts: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            updates_total = %self.updates_total,
            updates_per_sec = format!("{:.1}", self.updates_per_sec),
            avg_latency_us = %self.avg_update_latency_us,
            max_latency_us = %self.max_update_latency_us,
            p99_us = %self.lat_p99_us,
            invalid = %self.invalid_updates_total,
            armed = %self.armed_total,
            returned = %self.returned_total,
            fired = %self.fired_total,
            checkout_failed = %self.checkout_failed_total,
            tracked_users = %self.tracked_users,
            pending = %self.pending_checkouts,
            "metrics"
        );
    }
}
