//! Tests for the presence tracker
//!
//! Timer tests run on a paused tokio clock so deadlines are exact.

use super::*;
use async_trait::async_trait;

const DELAY: Duration = Duration::from_secs(60);

const OUTSIDE: (f64, f64) = (20.6050, -103.4150);
const INSIDE: (f64, f64) = (20.6075, -103.4105);

fn campus_quad() -> Geofence {
    Geofence::from_pairs(&[
        [20.6105, -103.4175],
        [20.6100, -103.4075],
        [20.6058, -103.4082],
        [20.6062, -103.4168],
    ])
    .unwrap()
}

/// Checkout double that records every call with the (paused) clock time
#[derive(Default)]
struct RecordingCheckout {
    calls: Mutex<Vec<(UserId, Instant)>>,
    started: AtomicU64,
    fail: bool,
    latency: Option<Duration>,
}

impl RecordingCheckout {
    fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    fn slow(latency: Duration) -> Self {
        Self { latency: Some(latency), ..Default::default() }
    }

    fn calls_for(&self, user_id: UserId) -> usize {
        self.calls.lock().iter().filter(|(u, _)| *u == user_id).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CheckoutService for RecordingCheckout {
    async fn checkout(&self, user_id: UserId) -> Result<(), CheckoutError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().push((user_id, Instant::now()));
        if self.fail {
            Err(CheckoutError::Status { status: 503, message: "unavailable".to_string() })
        } else {
            Ok(())
        }
    }
}

struct Harness {
    tracker: PresenceTracker,
    checkout: Arc<RecordingCheckout>,
    metrics: Arc<Metrics>,
}

fn harness_with(checkout: RecordingCheckout, settings: PresenceSettings) -> Harness {
    let checkout = Arc::new(checkout);
    let metrics = Arc::new(Metrics::new());
    let tracker = PresenceTracker::new(campus_quad(), settings, checkout.clone(), metrics.clone());
    Harness { tracker, checkout, metrics }
}

fn settings(policy: DeadlinePolicy) -> PresenceSettings {
    PresenceSettings {
        checkout_delay: DELAY,
        deadline_policy: policy,
        idle_ttl: Duration::from_secs(3600),
    }
}

fn harness() -> Harness {
    harness_with(RecordingCheckout::default(), settings(DeadlinePolicy::Fixed))
}

fn sample(user: i64, (lat, lon): (f64, f64)) -> LocationUpdate {
    LocationUpdate::new(UserId(user), lat, lon)
}

async fn advance(d: Duration) {
    tokio::time::sleep(d).await;
}

#[tokio::test(start_paused = true)]
async fn test_unseen_user_inside_arms_nothing() {
    let h = harness();

    let outcome = h.tracker.update_location(&sample(1, INSIDE)).unwrap();

    assert_eq!(outcome, UpdateOutcome::NoChange);
    assert_eq!(h.tracker.status(UserId(1)), PresenceStatus::Inside);
    assert_eq!(h.tracker.pending_checkouts(), 0);
    assert_eq!(h.tracker.tracked_users(), 1);

    advance(DELAY * 2).await;
    assert_eq!(h.checkout.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_user_status_defaults_inside() {
    let h = harness();
    assert_eq!(h.tracker.status(UserId(404)), PresenceStatus::Inside);
    assert_eq!(h.tracker.tracked_users(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_departure_fires_exactly_once_after_delay() {
    let h = harness();
    let t0 = Instant::now();

    let outcome = h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    assert_eq!(outcome, UpdateOutcome::Armed);
    assert_eq!(h.tracker.pending_checkouts(), 1);

    advance(DELAY - Duration::from_millis(10)).await;
    assert_eq!(h.checkout.total_calls(), 0);
    assert!(matches!(h.tracker.status(UserId(1)), PresenceStatus::OutsidePending { .. }));

    advance(Duration::from_millis(20)).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 1);
    assert_eq!(h.tracker.status(UserId(1)), PresenceStatus::OutsideFired);
    assert_eq!(h.tracker.pending_checkouts(), 0);

    let fired_at = h.checkout.calls.lock()[0].1;
    assert!(fired_at >= t0 + DELAY);
    assert!(fired_at < t0 + DELAY + Duration::from_millis(10));

    advance(DELAY * 3).await;
    assert_eq!(h.checkout.total_calls(), 1);
    assert_eq!(h.metrics.fired_total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_return_before_delay_cancels_checkout() {
    let h = harness();

    h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    advance(DELAY / 2).await;

    let outcome = h.tracker.update_location(&sample(1, INSIDE)).unwrap();
    assert_eq!(outcome, UpdateOutcome::ReturnedInside);
    assert_eq!(h.tracker.status(UserId(1)), PresenceStatus::Inside);
    assert_eq!(h.tracker.pending_checkouts(), 0);

    advance(DELAY * 3).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 0);
    assert_eq!(h.metrics.returned_total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_outside_keeps_original_deadline() {
    let h = harness();
    let t0 = Instant::now();

    assert_eq!(h.tracker.update_location(&sample(1, OUTSIDE)).unwrap(), UpdateOutcome::Armed);
    advance(DELAY / 2).await;
    assert_eq!(h.tracker.update_location(&sample(1, OUTSIDE)).unwrap(), UpdateOutcome::NoChange);
    assert_eq!(h.tracker.pending_checkouts(), 1);

    // Just past the original deadline, well before a restarted one
    advance(DELAY / 2 + Duration::from_millis(10)).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 1);

    let fired_at = h.checkout.calls.lock()[0].1;
    assert!(fired_at < t0 + DELAY + Duration::from_millis(10));

    advance(DELAY).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sliding_policy_restarts_countdown() {
    let h = harness_with(RecordingCheckout::default(), settings(DeadlinePolicy::Sliding));

    assert_eq!(h.tracker.update_location(&sample(1, OUTSIDE)).unwrap(), UpdateOutcome::Armed);
    advance(Duration::from_secs(30)).await;
    assert_eq!(h.tracker.update_location(&sample(1, OUTSIDE)).unwrap(), UpdateOutcome::Extended);
    assert_eq!(h.tracker.pending_checkouts(), 1);

    // Original deadline (60s) passes without firing
    advance(Duration::from_secs(40)).await;
    assert_eq!(h.checkout.total_calls(), 0);
    match h.tracker.status(UserId(1)) {
        PresenceStatus::OutsidePending { remaining } => {
            assert!(remaining <= Duration::from_secs(20));
            assert!(remaining > Duration::from_secs(19));
        }
        other => panic!("expected pending countdown, got {other:?}"),
    }

    // Restarted deadline (90s) fires once
    advance(Duration::from_secs(25)).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fired_user_must_return_before_rearming() {
    let h = harness();

    h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    advance(DELAY + Duration::from_millis(10)).await;
    assert_eq!(h.checkout.total_calls(), 1);

    // Still outside after checkout: nothing new is armed
    assert_eq!(h.tracker.update_location(&sample(1, OUTSIDE)).unwrap(), UpdateOutcome::NoChange);
    assert_eq!(h.tracker.status(UserId(1)), PresenceStatus::OutsideFired);
    assert_eq!(h.tracker.pending_checkouts(), 0);

    // Back on campus, then leaving again starts a new countdown
    assert_eq!(h.tracker.update_location(&sample(1, INSIDE)).unwrap(), UpdateOutcome::NoChange);
    assert_eq!(h.tracker.status(UserId(1)), PresenceStatus::Inside);
    assert_eq!(h.tracker.update_location(&sample(1, OUTSIDE)).unwrap(), UpdateOutcome::Armed);

    advance(DELAY + Duration::from_millis(10)).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_checkout_failure_is_not_retried() {
    let h = harness_with(RecordingCheckout::failing(), settings(DeadlinePolicy::Fixed));

    h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    advance(DELAY + Duration::from_millis(10)).await;

    assert_eq!(h.checkout.total_calls(), 1);
    assert_eq!(h.tracker.status(UserId(1)), PresenceStatus::OutsideFired);
    assert_eq!(h.metrics.checkout_failed_total(), 1);

    advance(DELAY * 3).await;
    assert_eq!(h.checkout.total_calls(), 1);
    assert_eq!(h.tracker.pending_checkouts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_return_during_inflight_checkout_does_not_abort_it() {
    let h = harness_with(
        RecordingCheckout::slow(Duration::from_secs(5)),
        settings(DeadlinePolicy::Fixed),
    );

    h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    advance(DELAY + Duration::from_secs(1)).await;

    // Call started but has not returned yet
    assert_eq!(h.checkout.started.load(Ordering::SeqCst), 1);
    assert_eq!(h.checkout.total_calls(), 0);

    let outcome = h.tracker.update_location(&sample(1, INSIDE)).unwrap();
    assert_eq!(outcome, UpdateOutcome::NoChange);
    assert_eq!(h.tracker.status(UserId(1)), PresenceStatus::Inside);

    advance(Duration::from_secs(10)).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 1);
    assert_eq!(h.checkout.started.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_users_are_independent() {
    let h = harness();

    h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    h.tracker.update_location(&sample(2, OUTSIDE)).unwrap();
    h.tracker.update_location(&sample(3, INSIDE)).unwrap();
    assert_eq!(h.tracker.pending_checkouts(), 2);

    advance(DELAY / 2).await;
    h.tracker.update_location(&sample(2, INSIDE)).unwrap();

    advance(DELAY).await;
    assert_eq!(h.checkout.calls_for(UserId(1)), 1);
    assert_eq!(h.checkout.calls_for(UserId(2)), 0);
    assert_eq!(h.checkout.calls_for(UserId(3)), 0);
    assert_eq!(h.tracker.tracked_users(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_update_leaves_no_state() {
    let h = harness();

    let missing = LocationUpdate { user_id: Some(UserId(1)), latitude: Some(20.6), longitude: None };
    assert_eq!(h.tracker.update_location(&missing), Err(LocationError::MissingCoordinates));

    let no_user = LocationUpdate { user_id: None, latitude: Some(20.6), longitude: Some(-103.4) };
    assert_eq!(h.tracker.update_location(&no_user), Err(LocationError::MissingUserId));

    assert_eq!(h.tracker.tracked_users(), 0);
    assert_eq!(h.tracker.pending_checkouts(), 0);
    assert_eq!(h.metrics.invalid_updates_total(), 2);
    assert_eq!(h.metrics.updates_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_evict_idle_skips_pending_entries() {
    let mut s = settings(DeadlinePolicy::Fixed);
    s.idle_ttl = Duration::from_secs(10);
    let h = harness_with(RecordingCheckout::default(), s);

    h.tracker.update_location(&sample(1, INSIDE)).unwrap();
    h.tracker.update_location(&sample(2, OUTSIDE)).unwrap();

    advance(Duration::from_secs(15)).await;
    assert_eq!(h.tracker.evict_idle(Instant::now()), 1);
    assert_eq!(h.tracker.tracked_users(), 1);
    assert!(matches!(h.tracker.status(UserId(2)), PresenceStatus::OutsidePending { .. }));

    // Once fired, the entry becomes evictable
    advance(DELAY).await;
    assert_eq!(h.checkout.calls_for(UserId(2)), 1);
    assert_eq!(h.tracker.evict_idle(Instant::now()), 1);
    assert_eq!(h.tracker.tracked_users(), 0);
    assert_eq!(h.metrics.evicted_total(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_user_starts_fresh() {
    let mut s = settings(DeadlinePolicy::Fixed);
    s.idle_ttl = Duration::from_secs(10);
    let h = harness_with(RecordingCheckout::default(), s);

    h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    advance(DELAY + Duration::from_secs(20)).await;
    assert_eq!(h.tracker.evict_idle(Instant::now()), 1);

    // Evicted while fired: a new departure arms again
    assert_eq!(h.tracker.update_location(&sample(1, OUTSIDE)).unwrap(), UpdateOutcome::Armed);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_pending_countdowns() {
    let h = harness();

    h.tracker.update_location(&sample(1, OUTSIDE)).unwrap();
    h.tracker.update_location(&sample(2, OUTSIDE)).unwrap();
    h.tracker.update_location(&sample(3, INSIDE)).unwrap();

    assert_eq!(h.tracker.shutdown(), 2);
    assert_eq!(h.tracker.tracked_users(), 0);
    assert_eq!(h.tracker.pending_checkouts(), 0);

    advance(DELAY * 2).await;
    assert_eq!(h.checkout.total_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_fire_once_per_departed_user() {
    let mut s = settings(DeadlinePolicy::Fixed);
    s.checkout_delay = Duration::from_millis(300);
    let h = harness_with(RecordingCheckout::default(), s);

    let mut tasks = Vec::new();
    for user in 0..64i64 {
        let tracker = h.tracker.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                tracker.update_location(&sample(user, OUTSIDE)).unwrap();
            }
            // Even users come back right away
            if user % 2 == 0 {
                tracker.update_location(&sample(user, INSIDE)).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1000)).await;

    for user in 0..64i64 {
        let expected = usize::from(user % 2 != 0);
        assert_eq!(h.checkout.calls_for(UserId(user)), expected, "user {user}");
    }
    assert_eq!(h.tracker.pending_checkouts(), 0);
    assert_eq!(h.metrics.armed_total(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_evict_racing_shutdown_keeps_gauges_consistent() {
    let mut s = settings(DeadlinePolicy::Fixed);
    s.idle_ttl = Duration::ZERO;

    for _ in 0..20 {
        let h = harness_with(RecordingCheckout::default(), s);
        for user in 0..200i64 {
            let position = if user % 4 == 0 { OUTSIDE } else { INSIDE };
            h.tracker.update_location(&sample(user, position)).unwrap();
        }

        let now = Instant::now();
        let evictor = {
            let tracker = h.tracker.clone();
            tokio::task::spawn_blocking(move || tracker.evict_idle(now))
        };
        let stopper = {
            let tracker = h.tracker.clone();
            tokio::task::spawn_blocking(move || tracker.shutdown())
        };
        let evicted = evictor.await.unwrap();
        let aborted = stopper.await.unwrap();

        assert_eq!(aborted, 50);
        assert!(evicted <= 150);
        assert_eq!(h.tracker.tracked_users(), 0);
        assert_eq!(h.tracker.pending_checkouts(), 0);

        h.tracker.update_location(&sample(1, INSIDE)).unwrap();
        assert_eq!(h.tracker.tracked_users(), 1);
    }
}
