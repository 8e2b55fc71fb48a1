//! Request Gate Integration Tests
//!
//! Drives the full admit → enqueue → dispatch → feedback loop through a
//! `RequestGate` built from TOML configuration, with time controlled by a
//! `ManualClock` so every transition is deterministic.

use async_trait::async_trait;
use sluice::config::SluiceConfig;
use sluice::{
    CircuitState, ExecutionReport, Executor, ManualClock, Priority, QueuedRequest, Request,
    RequestGate, SubmitOutcome,
};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[rate_limiter]
capacity = 10
refill_rate_per_second = 1.0

[circuit_breaker]
failure_threshold = 3
recovery_timeout_ms = 5000
half_open_trial_limit = 1

[scheduler]
metric = "p99_latency_ms"
window = 32
weights = { p0 = 0.4, p1 = 0.3, p2 = 0.2, p3 = 0.1 }
shed_thresholds = { p1 = 800.0, p2 = 400.0, p3 = 100.0 }
"#;

fn gate() -> (RequestGate<u32>, ManualClock) {
    sluice::logging::init_test_logging();
    let config = SluiceConfig::from_toml_str(CONFIG).unwrap();
    let clock = ManualClock::new();
    let gate = RequestGate::from_config_with_clock(&config, Arc::new(clock.clone())).unwrap();
    (gate, clock)
}

fn drain_with(gate: &RequestGate<u32>, report: ExecutionReport) -> usize {
    let mut n = 0;
    while let Some(request) = gate.try_dequeue() {
        gate.complete(&request, report);
        n += 1;
    }
    n
}

#[test]
fn test_config_file_builds_gate() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = SluiceConfig::from_file(file.path()).unwrap();
    let gate: RequestGate<()> = RequestGate::from_config(&config).unwrap();
    assert_eq!(gate.breaker().config().failure_threshold, 3);
    assert_eq!(gate.limiter().config_for("anyone").capacity, 10);
}

#[test]
fn test_burst_then_refill() {
    let (gate, clock) = gate();

    let burst: Vec<_> = (0..15)
        .map(|i| gate.submit(Request::new("client", Priority::P0, i)))
        .collect();
    assert!(burst[..10].iter().all(SubmitOutcome::is_admitted));
    assert!(burst[10..]
        .iter()
        .all(|o| *o == SubmitOutcome::RateLimited));

    clock.advance(Duration::from_secs(5));
    for i in 0..5 {
        assert!(gate.submit(Request::new("client", Priority::P0, i)).is_admitted());
    }
    assert_eq!(
        gate.submit(Request::new("client", Priority::P0, 99)),
        SubmitOutcome::RateLimited
    );

    // Other keys have their own budget
    assert!(gate.submit(Request::new("other", Priority::P0, 0)).is_admitted());
}

#[test]
fn test_breaker_trip_and_recovery_through_gate() {
    let (gate, clock) = gate();

    for i in 0..3 {
        assert!(gate.submit(Request::new("client", Priority::P0, i)).is_admitted());
    }
    assert_eq!(drain_with(&gate, ExecutionReport::failure(Duration::from_millis(5))), 3);
    assert_eq!(gate.breaker().state(), CircuitState::Open);

    assert_eq!(
        gate.submit(Request::new("client", Priority::P0, 3)),
        SubmitOutcome::CircuitOpen
    );

    // Exactly at the timeout the circuit is still open
    clock.advance(Duration::from_secs(5));
    assert_eq!(
        gate.submit(Request::new("client", Priority::P0, 4)),
        SubmitOutcome::CircuitOpen
    );

    clock.advance(Duration::from_millis(1));
    assert!(gate.submit(Request::new("client", Priority::P0, 5)).is_admitted());
    assert_eq!(gate.breaker().state(), CircuitState::HalfOpen);

    // Trial limit of one: a second trial is refused while the first is in flight
    assert_eq!(
        gate.submit(Request::new("client", Priority::P0, 6)),
        SubmitOutcome::CircuitOpen
    );

    assert_eq!(drain_with(&gate, ExecutionReport::success(Duration::from_millis(5))), 1);
    assert_eq!(gate.breaker().state(), CircuitState::Closed);

    let stats = gate.stats();
    assert_eq!(stats.circuit_open, 3);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.succeeded, 1);
}

#[test]
fn test_latency_feedback_sheds_low_classes_first() {
    let (gate, _clock) = gate();

    // p99 of 500ms: above the P3 and P2 thresholds, below P1
    gate.submit(Request::new("warmup", Priority::P0, 0));
    drain_with(&gate, ExecutionReport::success(Duration::from_millis(500)));
    assert_eq!(gate.signal().p99_ms(), 500.0);

    assert_eq!(
        gate.submit(Request::new("a", Priority::P3, 1)),
        SubmitOutcome::Shed
    );
    assert_eq!(
        gate.submit(Request::new("b", Priority::P2, 2)),
        SubmitOutcome::Shed
    );
    assert!(gate.submit(Request::new("c", Priority::P1, 3)).is_admitted());
    assert!(gate.submit(Request::new("d", Priority::P0, 4)).is_admitted());
    assert_eq!(gate.stats().shed, 2);
}

#[test]
fn test_cancelled_request_never_dispatches() {
    let (gate, _clock) = gate();
    let keep = gate.submit(Request::new("a", Priority::P2, 1)).id().unwrap();
    let withdrawn_id = gate.submit(Request::new("a", Priority::P2, 2)).id().unwrap();

    let withdrawn = gate.cancel(withdrawn_id).unwrap();
    assert_eq!(withdrawn.payload, 2);

    let next = gate.try_dequeue().unwrap();
    assert_eq!(next.id, keep);
    assert!(gate.try_dequeue().is_none());
    assert!(gate.cancel(keep).is_none(), "already dispatched");
}

struct FixedExecutor {
    fail: bool,
    calls: AtomicU64,
}

#[async_trait]
impl Executor<u32> for FixedExecutor {
    async fn execute(&self, _request: &QueuedRequest<u32>) -> ExecutionReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        if self.fail {
            ExecutionReport::failure(Duration::from_millis(1))
        } else {
            ExecutionReport::success(Duration::from_millis(1))
        }
    }
}

#[tokio::test]
async fn test_dispatch_pool_feeds_breaker() {
    let (gate, _clock) = gate();
    let gate = Arc::new(gate);
    let executor = Arc::new(FixedExecutor {
        fail: true,
        calls: AtomicU64::new(0),
    });
    let pool = gate.spawn_dispatchers(executor.clone(), 2);

    for i in 0..3 {
        assert!(gate
            .submit(Request::new(format!("k{}", i), Priority::P0, i))
            .is_admitted());
    }
    gate.shutdown();
    assert_eq!(pool.join().await.unwrap(), 3);

    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(gate.breaker().state(), CircuitState::Open);
    assert_eq!(gate.stats().failed, 3);
}

#[tokio::test]
async fn test_blocking_dequeue_wakes_on_submit() {
    let (gate, _clock) = gate();
    let gate = Arc::new(gate);

    let waiter = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move { gate.dequeue().await.map(|r| r.payload) })
    };
    tokio::task::yield_now().await;

    assert!(gate.submit(Request::new("a", Priority::P1, 42)).is_admitted());
    assert_eq!(waiter.await.unwrap(), Some(42));

    gate.shutdown();
    assert!(gate.dequeue().await.is_none());
}
