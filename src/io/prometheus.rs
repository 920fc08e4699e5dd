//! Prometheus text exposition for presence metrics
//!
//! Served at /metrics by the location API.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_CHECKOUT_BOUNDS, METRICS_NUM_BUCKETS,
};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_update_metrics(&mut output, site_id, &summary);
    write_presence_metrics(&mut output, site_id, &summary);
    write_checkout_metrics(&mut output, site_id, &summary);

    output
}

fn write_update_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_location_updates_total",
        "Accepted location updates",
        MetricType::Counter,
        site,
        summary.updates_total,
    );
    write_metric(
        output,
        "geofence_location_updates_invalid_total",
        "Location updates rejected by validation",
        MetricType::Counter,
        site,
        summary.invalid_updates_total,
    );
    write_histogram(
        output,
        "geofence_update_latency_us",
        "Location update processing latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.update_lat_sum_us,
    );
}

fn write_presence_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_countdowns_armed_total",
        "Checkout countdowns armed on departure",
        MetricType::Counter,
        site,
        summary.armed_total,
    );
    write_metric(
        output,
        "geofence_countdowns_cancelled_total",
        "Countdowns cancelled because the user came back",
        MetricType::Counter,
        site,
        summary.returned_total,
    );
    write_metric(
        output,
        "geofence_countdowns_extended_total",
        "Countdowns restarted by a repeated outside sample",
        MetricType::Counter,
        site,
        summary.extended_total,
    );
    write_metric(
        output,
        "geofence_countdowns_fired_total",
        "Countdowns that elapsed and dispatched a checkout",
        MetricType::Counter,
        site,
        summary.fired_total,
    );
    write_metric(
        output,
        "geofence_presence_evicted_total",
        "Idle presence entries evicted",
        MetricType::Counter,
        site,
        summary.evicted_total,
    );
    write_metric(
        output,
        "geofence_tracked_users",
        "Users currently held in the presence map",
        MetricType::Gauge,
        site,
        summary.tracked_users,
    );
    write_metric(
        output,
        "geofence_pending_checkouts",
        "Countdowns currently armed",
        MetricType::Gauge,
        site,
        summary.pending_checkouts,
    );
}

fn write_checkout_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_checkouts_ok_total",
        "Checkout calls accepted by the checkout service",
        MetricType::Counter,
        site,
        summary.checkout_ok_total,
    );
    write_metric(
        output,
        "geofence_checkouts_failed_total",
        "Checkout calls that failed or were rejected",
        MetricType::Counter,
        site,
        summary.checkout_failed_total,
    );
    write_histogram(
        output,
        "geofence_checkout_latency_ms",
        "Checkout call latency in milliseconds",
        site,
        &summary.checkout_lat_buckets,
        &METRICS_CHECKOUT_BOUNDS,
        summary.checkout_lat_sum_ms,
    );
}
