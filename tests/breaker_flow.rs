//! End-to-end behavior of the breaker over real stores with a manual clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};

use failopen::breaker::{Evaluation, FailOpenBreaker};
use failopen::config::BreakerConfig;
use failopen::detect::RecordingHook;
use failopen::store::{
    CounterStore, HistoryStore, MemoryStore, Outcome, RateSample, SqliteStore, StoreError,
    WindowState,
};
use failopen::window::{Clock, ManualClock};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap()
}

fn small_config() -> BreakerConfig {
    let mut config = BreakerConfig::default();
    config.evaluation.min_attempts = 5;
    config
}

struct Harness {
    breaker: Arc<FailOpenBreaker>,
    store: Arc<MemoryStore>,
    clock: ManualClock,
    hook: Arc<RecordingHook>,
}

fn harness(config: BreakerConfig) -> Harness {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let hook = Arc::new(RecordingHook::new());
    let breaker = FailOpenBreaker::new(config, store.clone(), store.clone())
        .unwrap()
        .with_hook(hook.clone())
        .with_clock(Arc::new(clock.clone()));
    Harness {
        breaker: Arc::new(breaker),
        store,
        clock,
        hook,
    }
}

/// Track `n` attempts at the current clock; every `fail_every`-th one fails (0: none).
fn drive(h: &Harness, n: usize, fail_every: usize) -> Vec<Evaluation> {
    let mut evaluations = Vec::new();
    for i in 0..n {
        let success = fail_every == 0 || i % fail_every != 0;
        if let Some(eval) = h.breaker.track_observed(success, h.clock.now()).unwrap() {
            evaluations.push(eval);
        }
    }
    evaluations
}

#[test]
fn test_rollover_evaluates_previous_bucket_exactly_once() {
    let h = harness(small_config());

    let first = drive(&h, 20, 10);
    assert_eq!(first.len(), 1, "first attempt evaluates the (empty) previous bucket");
    assert!(matches!(first[0], Evaluation::Skipped { .. }));

    h.clock.advance(Duration::hours(4));
    let second = drive(&h, 20, 0);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].bucket().to_string(), "2024-05-01_0");
    match &second[0] {
        Evaluation::Recorded {
            counts,
            rate_percent,
            appended,
            ..
        } => {
            assert_eq!(counts.success, 18);
            assert_eq!(counts.failure, 2);
            assert!((rate_percent - 90.0).abs() < 1e-9);
            assert!(appended);
        }
        other => panic!("unexpected evaluation: {other:?}"),
    }

    let history = h.breaker.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].bucket_id, "2024-05-01_0");
}

#[test]
fn test_plain_track_records_one_sample_per_window() {
    let h = harness(small_config());
    for _ in 0..10 {
        h.breaker.track(true).unwrap();
    }
    h.clock.advance(Duration::hours(4));
    for _ in 0..10 {
        h.breaker.track(false).unwrap();
    }
    assert_eq!(h.breaker.history().unwrap().len(), 1);

    let status = h.breaker.status().unwrap();
    assert_eq!(status.previous.success, 10);
    assert_eq!(status.current.failure, 10);
    assert_eq!(status.current.rate_percent, Some(0.0));
    assert_eq!(status.history_cap, 180);
}

#[test]
fn test_ttl_is_not_extended_by_later_increments() {
    let h = harness(small_config());
    h.breaker.track(true).unwrap();
    let bucket = h.breaker.buckets().bucket_id(t0());
    let key = h.breaker.keys().counter(&bucket, Outcome::Success);
    let first = h.store.expires_at(&key).unwrap().unwrap();
    assert_eq!(first, t0() + Duration::hours(8));

    h.clock.advance(Duration::hours(2));
    h.breaker.track(true).unwrap();
    assert_eq!(h.store.expires_at(&key).unwrap(), Some(first));
    assert_eq!(h.store.get(&key).unwrap(), 2);
}

#[test]
fn test_history_converges_to_cap() {
    let mut config = small_config();
    config.window.history_days = 1;
    let max = config.max_entries();
    assert_eq!(max, 6);
    let h = harness(config);

    for _ in 0..(max + 5) {
        drive(&h, 10, 0);
        h.clock.advance(Duration::hours(4));
    }
    drive(&h, 1, 0);

    let history = h.breaker.history().unwrap();
    assert_eq!(history.len(), max);
    let newest = h.breaker.buckets().previous_bucket_id(h.clock.now()).to_string();
    assert_eq!(history.last().unwrap().bucket_id, newest);
}

#[test]
fn test_outage_trips_hook_and_keeps_baseline_clean() {
    let h = harness(small_config());
    let key = h.breaker.keys().history();
    let baseline = [90.0, 92.0, 91.0, 89.0, 93.0, 90.0, 91.0, 92.0, 90.0, 91.0];
    for (i, rate) in baseline.iter().enumerate() {
        let sample = RateSample {
            bucket_id: format!("2024-04-01_{i}"),
            rate_percent: *rate,
            recorded_at: t0(),
        };
        h.store.push_capped(&key, &sample, 180).unwrap();
    }

    // Half of the attempts fail.
    drive(&h, 40, 2);
    h.clock.advance(Duration::hours(4));
    let evals = drive(&h, 1, 0);

    assert!(evals[0].is_tripped());
    assert_eq!(h.hook.events().len(), 1);
    assert_eq!(h.hook.events()[0].bucket_id, "2024-05-01_0");
    assert_eq!(h.breaker.history().unwrap().len(), 10);

    // The baseline still judges the next normal window as normal.
    drive(&h, 40, 10);
    h.clock.advance(Duration::hours(4));
    let evals = drive(&h, 1, 0);
    assert!(matches!(evals[0], Evaluation::Recorded { appended: true, .. }));
}

#[test]
fn test_namespaces_do_not_collide() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let mut a_cfg = small_config();
    a_cfg.store.namespace = "recaptcha".to_string();
    let mut b_cfg = small_config();
    b_cfg.store.namespace = "turnstile".to_string();
    let a = FailOpenBreaker::new(a_cfg, store.clone(), store.clone())
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let b = FailOpenBreaker::new(b_cfg, store.clone(), store.clone())
        .unwrap()
        .with_clock(Arc::new(clock.clone()));

    for _ in 0..7 {
        a.track(true).unwrap();
    }
    b.track(false).unwrap();

    assert_eq!(a.status().unwrap().current.total, 7);
    assert_eq!(b.status().unwrap().current.total, 1);
    assert_eq!(b.status().unwrap().current.failure, 1);
}

#[test]
fn test_concurrent_tracking_counts_every_attempt() {
    let h = harness(small_config());
    drive(&h, 10, 0);
    h.clock.advance(Duration::hours(4));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let breaker = h.breaker.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    breaker.track(i % 5 != 0).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let status = h.breaker.status().unwrap();
    assert_eq!(status.current.total, 400);
    assert_eq!(status.current.failure, 80);
    // However many threads saw the fresh window, the previous bucket lands once.
    assert_eq!(h.breaker.history().unwrap().len(), 1);
}

/// Store whose every operation fails the same way.
struct BrokenStore {
    error: fn() -> StoreError,
    calls: AtomicUsize,
}

impl BrokenStore {
    fn new(error: fn() -> StoreError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

impl CounterStore for BrokenStore {
    fn window_state(&self, _: &str, _: &str) -> Result<WindowState, StoreError> {
        self.fail()
    }
    fn incr_with_expiry(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
        self.fail()
    }
    fn get(&self, _: &str) -> Result<u64, StoreError> {
        self.fail()
    }
    fn expires_at(&self, _: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.fail()
    }
    fn purge_expired(&self) -> Result<usize, StoreError> {
        self.fail()
    }
}

impl HistoryStore for BrokenStore {
    fn push_capped(&self, _: &str, _: &RateSample, _: usize) -> Result<bool, StoreError> {
        self.fail()
    }
    fn range(&self, _: &str) -> Result<Vec<RateSample>, StoreError> {
        self.fail()
    }
    fn len(&self, _: &str) -> Result<usize, StoreError> {
        self.fail()
    }
    fn clear(&self, _: &str) -> Result<usize, StoreError> {
        self.fail()
    }
}

#[test]
fn test_transport_errors_never_reach_caller() {
    let store = Arc::new(BrokenStore::new(|| {
        StoreError::Transport("connection refused".to_string())
    }));
    let breaker = FailOpenBreaker::new(small_config(), store.clone(), store.clone()).unwrap();

    assert!(breaker.track(true).is_ok());
    assert!(breaker.track(false).is_ok());
    assert!(store.calls.load(Ordering::SeqCst) >= 2);
}

#[test]
fn test_backend_errors_are_surfaced() {
    let store = Arc::new(BrokenStore::new(|| {
        StoreError::Backend("corrupt counter".to_string())
    }));
    let breaker = FailOpenBreaker::new(small_config(), store.clone(), store).unwrap();

    let err = breaker.track(true).unwrap_err();
    assert!(!err.is_transport());
}

/// Window checks work, every increment times out.
struct IncrTimeout {
    inner: MemoryStore,
    increments: AtomicUsize,
}

impl CounterStore for IncrTimeout {
    fn window_state(&self, success: &str, failure: &str) -> Result<WindowState, StoreError> {
        self.inner.window_state(success, failure)
    }
    fn incr_with_expiry(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Transport("timeout".to_string()))
    }
    fn get(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.get(key)
    }
    fn expires_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.expires_at(key)
    }
    fn purge_expired(&self) -> Result<usize, StoreError> {
        self.inner.purge_expired()
    }
}

#[test]
fn test_increment_timeout_is_swallowed() {
    let clock = ManualClock::new(t0());
    let counters = Arc::new(IncrTimeout {
        inner: MemoryStore::new(Arc::new(clock.clone())),
        increments: AtomicUsize::new(0),
    });
    let history = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let breaker = FailOpenBreaker::new(small_config(), counters.clone(), history)
        .unwrap()
        .with_clock(Arc::new(clock.clone()));

    assert!(breaker.track(true).is_ok());
    assert!(breaker.track(false).is_ok());
    assert_eq!(counters.increments.load(Ordering::SeqCst), 2);
}

/// Counters work, the history store is unreachable.
#[test]
fn test_unreachable_history_still_counts_attempt() {
    let clock = ManualClock::new(t0());
    let counters = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let history = Arc::new(BrokenStore::new(|| StoreError::Transport("timeout".to_string())));
    let breaker = FailOpenBreaker::new(small_config(), counters.clone(), history)
        .unwrap()
        .with_clock(Arc::new(clock.clone()));

    for _ in 0..10 {
        breaker.track(true).unwrap();
    }
    clock.advance(Duration::hours(4));
    breaker.track(true).unwrap();

    let bucket = breaker.buckets().bucket_id(clock.now());
    let key = breaker.keys().counter(&bucket, Outcome::Success);
    assert_eq!(counters.get(&key).unwrap(), 1);
}

#[test]
fn test_sqlite_backed_rollover() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let clock = ManualClock::new(t0());
    let pool = failopen::store::sqlite::open_pool(&dir.path().join("failopen.db"), 1000)?;
    let store = Arc::new(SqliteStore::new(pool, Arc::new(clock.clone())));
    let breaker = FailOpenBreaker::new(small_config(), store.clone(), store.clone())?
        .with_clock(Arc::new(clock.clone()));

    for i in 0..10 {
        breaker.track(i != 0)?;
    }
    clock.advance(Duration::hours(4));
    let eval = breaker.track_observed(true, clock.now())?.expect("new window");
    assert!(matches!(eval, Evaluation::Recorded { appended: true, .. }));

    // Same evaluation again: same decision, no second sample.
    let again = breaker.evaluate_previous_window()?;
    assert_eq!(eval.decision(), again.decision());
    assert_eq!(store.len(&breaker.keys().history())?, 1);
    Ok(())
}
