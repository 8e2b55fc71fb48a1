/*!
 * Request gate
 *
 * Composes the circuit breaker, the rate limiter and the priority scheduler
 * into one admit → enqueue → dispatch pipeline, and closes the feedback loop
 * from the executor back into the breaker and the overload signal.
 */

use crate::config::SluiceConfig;
use crate::error::{Result, SluiceError};
use crate::executor::{ExecutionReport, Executor};
use crate::stats::{GateStats, GateStatsSnapshot};
use sluice_core_resilience::{
    system_clock, CircuitBreaker, Enqueued, OverloadSignal, Permit, PriorityScheduler,
    QueuedRequest, RateLimiter, Request, RequestId, SharedClock,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of [`RequestGate::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for dispatch under this id
    Admitted(RequestId),
    /// The key's token bucket could not cover the cost
    RateLimited,
    /// The downstream dependency is failing fast
    CircuitOpen,
    /// The request's class is being shed, or the gate is shutting down
    Shed,
}

impl SubmitOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, SubmitOutcome::Admitted(_))
    }

    pub fn id(&self) -> Option<RequestId> {
        match self {
            SubmitOutcome::Admitted(id) => Some(*id),
            _ => None,
        }
    }
}

/// Admission control and dispatch for one protected dependency
#[derive(Debug)]
pub struct RequestGate<T> {
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    scheduler: PriorityScheduler<T>,
    signal: Arc<OverloadSignal>,
    stats: GateStats,
    /// Requests admitted on a half-open trial permit and not yet completed
    trials: Mutex<HashMap<RequestId, Permit>>,
}

impl<T> RequestGate<T> {
    /// Assemble a gate from already-built components
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        limiter: RateLimiter,
        scheduler: PriorityScheduler<T>,
    ) -> Self {
        let signal = Arc::clone(scheduler.signal());
        Self {
            breaker,
            limiter,
            scheduler,
            signal,
            stats: GateStats::new(),
            trials: Mutex::new(HashMap::new()),
        }
    }

    /// Build every component from validated configuration using the system clock
    pub fn from_config(config: &SluiceConfig) -> Result<Self> {
        Self::from_config_with_clock(config, system_clock())
    }

    /// Build every component from configuration, all reading time from `clock`
    pub fn from_config_with_clock(config: &SluiceConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let mut limiter = RateLimiter::with_clock(config.rate_limiter.bucket(), Arc::clone(&clock))?;
        for (key, bucket) in &config.rate_limiter.overrides {
            limiter = limiter.with_override(key.clone(), *bucket)?;
        }

        let breaker = Arc::new(
            CircuitBreaker::with_clock(config.circuit_breaker.breaker(), Arc::clone(&clock))?
                .named("downstream"),
        );
        let signal = Arc::new(OverloadSignal::new(config.scheduler.window)?);
        let scheduler =
            PriorityScheduler::with_clock(config.scheduler.scheduler(), signal, clock)?;

        info!(
            capacity = config.rate_limiter.capacity,
            overrides = config.rate_limiter.overrides.len(),
            failure_threshold = config.circuit_breaker.failure_threshold,
            metric = %config.scheduler.metric,
            "Request gate configured"
        );

        Ok(Self::new(breaker, limiter, scheduler))
    }

    /// Decide admission for `request` and queue it if admitted.
    ///
    /// Never waits on dispatch. The breaker is consulted first so an open
    /// circuit costs the caller no tokens.
    pub fn submit(&self, request: Request<T>) -> SubmitOutcome {
        self.stats.record_submitted();
        let priority = request.priority;

        let Some(permit) = self.breaker.try_acquire() else {
            self.stats.record_circuit_open();
            debug!(key = %request.key, %priority, "Rejected: circuit open");
            return SubmitOutcome::CircuitOpen;
        };

        if !self.limiter.allow(&request.key, request.cost) {
            self.breaker.record_abandoned(permit);
            self.stats.record_rate_limited();
            debug!(key = %request.key, %priority, "Rejected: rate limited");
            return SubmitOutcome::RateLimited;
        }

        // A trial is registered before any dispatcher can complete it
        let mut trials = permit.is_trial().then(|| self.trials());
        match self.scheduler.enqueue(request) {
            Enqueued::Accepted(id) => {
                if let Some(trials) = trials.as_mut() {
                    trials.insert(id, permit);
                }
                drop(trials);
                self.stats.record_admitted();
                SubmitOutcome::Admitted(id)
            }
            Enqueued::Shed => {
                drop(trials);
                self.breaker.record_abandoned(permit);
                self.stats.record_shed();
                debug!(%priority, "Rejected: shed");
                SubmitOutcome::Shed
            }
        }
    }

    /// Withdraw a queued request before it is dispatched
    pub fn cancel(&self, id: RequestId) -> Option<QueuedRequest<T>> {
        let request = self.scheduler.cancel(id)?;
        if let Some(permit) = self.trials().remove(&id) {
            self.breaker.record_abandoned(permit);
        }
        self.stats.record_cancelled();
        Some(request)
    }

    /// Take the next request in weighted order without waiting
    pub fn try_dequeue(&self) -> Option<QueuedRequest<T>> {
        let request = self.scheduler.try_dequeue()?;
        self.stats.record_dispatched();
        Some(request)
    }

    /// Wait for the next request; `None` after shutdown once the queue drains
    pub async fn dequeue(&self) -> Option<QueuedRequest<T>> {
        let request = self.scheduler.dequeue().await?;
        self.stats.record_dispatched();
        Some(request)
    }

    /// Feed a dispatched request's outcome back into the breaker and the overload signal.
    ///
    /// While the breaker is half-open only requests admitted on a trial
    /// permit move it; late results from before the trip are dropped.
    pub fn complete(&self, request: &QueuedRequest<T>, report: ExecutionReport) {
        let permit = self.trials().remove(&request.id).unwrap_or(Permit::Normal);
        self.signal.record_latency(report.latency);
        self.breaker.record_outcome(permit, report.is_success());
        if report.is_success() {
            self.stats.record_succeeded();
        } else {
            self.stats.record_failed();
        }
        debug!(
            id = %request.id,
            priority = %request.priority,
            success = report.is_success(),
            latency_ms = report.latency.as_millis() as u64,
            "Request completed"
        );
    }

    /// Stop admitting work. Dispatchers finish what is queued, then exit.
    pub fn shutdown(&self) {
        info!(queued = self.scheduler.len(), "Request gate shutting down");
        self.scheduler.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.scheduler.is_closed()
    }

    /// Drop rate limit state for keys idle longer than `max_idle`
    pub fn evict_idle_keys(&self, max_idle: Duration) -> usize {
        self.limiter.evict_idle(max_idle)
    }

    pub fn stats(&self) -> GateStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn scheduler(&self) -> &PriorityScheduler<T> {
        &self.scheduler
    }

    pub fn signal(&self) -> &Arc<OverloadSignal> {
        &self.signal
    }

    fn trials(&self) -> MutexGuard<'_, HashMap<RequestId, Permit>> {
        self.trials.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> RequestGate<T> {
    /// Dequeue and execute until the gate is shut down and drained.
    /// Returns the number of requests this dispatcher handled.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        executor: Arc<dyn Executor<T>>,
        worker: usize,
    ) -> u64 {
        info!(worker, "Dispatcher started");
        let mut handled = 0u64;
        while let Some(request) = self.dequeue().await {
            let report = executor.execute(&request).await;
            self.complete(&request, report);
            handled += 1;
        }
        info!(worker, handled, "Dispatcher stopped");
        handled
    }

    /// Spawn `workers` dispatcher tasks on the current tokio runtime
    pub fn spawn_dispatchers(
        self: &Arc<Self>,
        executor: Arc<dyn Executor<T>>,
        workers: usize,
    ) -> DispatcherPool {
        let handles = (0..workers.max(1))
            .map(|worker| {
                let gate = Arc::clone(self);
                let executor = Arc::clone(&executor);
                tokio::spawn(gate.run_dispatcher(executor, worker))
            })
            .collect();
        DispatcherPool { handles }
    }
}

/// Handles to running dispatcher tasks
#[derive(Debug)]
pub struct DispatcherPool {
    handles: Vec<JoinHandle<u64>>,
}

impl DispatcherPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every dispatcher to exit. Call after [`RequestGate::shutdown`].
    ///
    /// Returns the total number of requests dispatched by the pool.
    pub async fn join(self) -> Result<u64> {
        let mut total = 0;
        let mut failures = Vec::new();
        for (worker, result) in futures::future::join_all(self.handles)
            .await
            .into_iter()
            .enumerate()
        {
            match result {
                Ok(handled) => total += handled,
                Err(e) => {
                    warn!(worker, error = %e, "Dispatcher task ended abnormally");
                    failures.push(format!("worker {}: {}", worker, e));
                }
            }
        }
        if failures.is_empty() {
            Ok(total)
        } else {
            Err(SluiceError::Dispatcher(failures.join("; ")))
        }
    }
}
