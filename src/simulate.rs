/*!
 * Synthetic workload driver
 *
 * Pushes randomised traffic through a `RequestGate` against an executor that
 * fails and stalls with configurable probability. Used by `sluice simulate`
 * to see how a configuration behaves before it meets real traffic.
 */

use crate::config::SluiceConfig;
use crate::error::Result;
use crate::executor::{ExecutionReport, Executor};
use crate::gate::{RequestGate, SubmitOutcome};
use crate::stats::GateStatsSnapshot;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sluice_core_resilience::{Priority, QueuedRequest, Request};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

/// Knobs for one simulation run
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParams {
    pub requests: u64,
    /// Probability in [0, 1] that a call fails
    pub failure_rate: f64,
    /// Mean executor latency
    pub latency: Duration,
    /// Distinct admission keys traffic is spread over
    pub keys: usize,
    /// Gap between consecutive submissions
    pub interarrival: Duration,
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            requests: 1_000,
            failure_rate: 0.05,
            latency: Duration::from_millis(2),
            keys: 8,
            interarrival: Duration::from_micros(500),
            seed: 0x5eed,
        }
    }
}

/// Executor with random failures and latency jitter of ±50% around the mean
#[derive(Debug)]
pub struct RandomExecutor {
    failure_rate: f64,
    latency: Duration,
    rng: Mutex<StdRng>,
}

impl RandomExecutor {
    pub fn new(failure_rate: f64, latency: Duration, seed: u64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn roll(&self) -> (bool, Duration) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let failed = rng.random_bool(self.failure_rate);
        let jitter: f64 = rng.random_range(0.5..1.5);
        (failed, self.latency.mul_f64(jitter))
    }
}

#[async_trait]
impl<T: Send + Sync> Executor<T> for RandomExecutor {
    async fn execute(&self, _request: &QueuedRequest<T>) -> ExecutionReport {
        let (failed, latency) = self.roll();
        tokio::time::sleep(latency).await;
        if failed {
            ExecutionReport::failure(latency)
        } else {
            ExecutionReport::success(latency)
        }
    }
}

/// What a run produced
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub stats: GateStatsSnapshot,
    pub dispatched_by_pool: u64,
    pub final_circuit_state: String,
    pub p99_latency_ms: f64,
    /// Admitted requests per class, P0 first
    pub admitted_by_priority: [u64; Priority::COUNT],
}

impl SimulationReport {
    pub fn summary(&self) -> String {
        let mut out = self.stats.summary();
        out.push_str(&format!("Circuit state: {}\n", self.final_circuit_state));
        out.push_str(&format!("p99 latency:   {:.2} ms\n", self.p99_latency_ms));
        for priority in Priority::ALL {
            out.push_str(&format!(
                "Admitted {}:   {}\n",
                priority,
                self.admitted_by_priority[priority.index()]
            ));
        }
        out
    }
}

/// Run `params.requests` submissions through a gate built from `config`
pub async fn run(config: &SluiceConfig, params: &SimulationParams) -> Result<SimulationReport> {
    let gate: Arc<RequestGate<u64>> = Arc::new(RequestGate::from_config(config)?);
    let executor = Arc::new(RandomExecutor::new(
        params.failure_rate,
        params.latency,
        params.seed,
    ));
    let pool = gate.spawn_dispatchers(executor, config.dispatch.workers);

    info!(
        requests = params.requests,
        failure_rate = params.failure_rate,
        latency_ms = params.latency.as_millis() as u64,
        workers = pool.len(),
        "Simulation started"
    );

    let mut traffic = StdRng::seed_from_u64(params.seed.wrapping_add(1));
    let keys = params.keys.max(1);
    let mut admitted_by_priority = [0u64; Priority::COUNT];

    for n in 0..params.requests {
        let (key, priority) = {
            let key = format!("client-{}", traffic.random_range(0..keys));
            let priority = Priority::ALL[traffic.random_range(0..Priority::COUNT)];
            (key, priority)
        };
        if let SubmitOutcome::Admitted(_) = gate.submit(Request::new(key, priority, n)) {
            admitted_by_priority[priority.index()] += 1;
        }
        // Outcomes must reach the breaker and the overload signal while traffic is still flowing
        if params.interarrival.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(params.interarrival).await;
        }
    }

    gate.shutdown();
    let dispatched_by_pool = pool.join().await?;
    let stats = gate.stats();
    let state = gate.breaker().state();

    info!(
        admitted = stats.admitted,
        rejected = stats.rejected(),
        "Simulation finished"
    );

    Ok(SimulationReport {
        stats,
        dispatched_by_pool,
        final_circuit_state: state.to_string(),
        p99_latency_ms: gate.signal().p99_ms(),
        admitted_by_priority,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_extremes() {
        let always = RandomExecutor::new(1.0, Duration::from_millis(10), 1);
        let never = RandomExecutor::new(0.0, Duration::from_millis(10), 1);
        for _ in 0..20 {
            let (failed, latency) = always.roll();
            assert!(failed);
            assert!(latency >= Duration::from_millis(5) && latency <= Duration::from_millis(15));
            assert!(!never.roll().0);
        }
    }

    #[test]
    fn test_failure_rate_is_clamped() {
        let executor = RandomExecutor::new(3.0, Duration::ZERO, 1);
        assert!(executor.roll().0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_admitted_request_is_dispatched() {
        let mut config = SluiceConfig::default();
        config.dispatch.workers = 2;
        let params = SimulationParams {
            requests: 200,
            failure_rate: 0.0,
            ..Default::default()
        };

        let report = run(&config, &params).await.unwrap();
        assert_eq!(report.stats.submitted, 200);
        assert_eq!(report.stats.admitted, report.stats.dispatched);
        assert_eq!(report.dispatched_by_pool, report.stats.dispatched);
        assert_eq!(report.stats.failed, 0);
        assert_eq!(
            admitted_total(&report),
            report.stats.admitted,
            "per-class counts add up"
        );
        assert_eq!(report.final_circuit_state, "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_dependency_trips_breaker() {
        let mut config = SluiceConfig::default();
        config.circuit_breaker.failure_threshold = 3;
        config.circuit_breaker.recovery_timeout_ms = 60_000;
        let params = SimulationParams {
            requests: 500,
            failure_rate: 1.0,
            ..Default::default()
        };

        let report = run(&config, &params).await.unwrap();
        assert!(report.stats.circuit_open > 0);
        assert_eq!(report.stats.succeeded, 0);
        assert!(report.summary().contains("Circuit state"));
    }

    fn admitted_total(report: &SimulationReport) -> u64 {
        report.admitted_by_priority.iter().sum()
    }
}
