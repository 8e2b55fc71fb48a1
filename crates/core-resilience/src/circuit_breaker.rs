//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a
//! dependency is experiencing issues. It has three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Dependency is unhealthy, calls are rejected immediately
//! - HalfOpen: A limited number of trial calls trial for recovery
//!
//! The breaker never invokes the protected operation itself. Callers ask
//! [`CircuitBreaker::can_execute`] and report exactly one of
//! [`record_success`](CircuitBreaker::record_success) or
//! [`record_failure`](CircuitBreaker::record_failure) per permitted call.
//! The Open→HalfOpen transition is evaluated lazily on the next
//! `can_execute`, there is no background timer.
//!
//! Callers that need to know what kind of permission they were given use
//! [`CircuitBreaker::try_acquire`] instead. The returned [`Permit`] is
//! decided under the same lock that counts trial slots, and can be handed
//! back with [`record_abandoned`](CircuitBreaker::record_abandoned) or
//! settled with [`record_outcome`](CircuitBreaker::record_outcome).

use crate::clock::{system_clock, SharedClock};
use crate::error::ConfigError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately
    Open,
    /// Circuit is half-open, trial calls trial recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing trial calls
    pub recovery_timeout: Duration,
    /// Trial calls allowed in half-open; this many successes close the circuit
    pub half_open_trial_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_trial_limit: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }
        if self.half_open_trial_limit == 0 {
            return Err(ConfigError::InvalidTrialLimit);
        }
        Ok(())
    }
}

/// Permission to make one call, as handed out by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permit {
    /// Granted while closed
    Normal,
    /// One of the trial slots of a half-open episode
    Trial { episode: u64 },
}

impl Permit {
    pub fn is_trial(&self) -> bool {
        matches!(self, Permit::Trial { .. })
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Trial permits handed out in the current half-open episode
    pub trials_permitted: u32,
    /// Time left before a trial is allowed, if currently open
    pub open_remaining: Option<Duration>,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Only meaningful while half-open
    success_count: u32,
    trials_permitted: u32,
    /// Incremented on every Open→HalfOpen transition
    episode: u64,
    last_failure: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            trials_permitted: 0,
            episode: 0,
            last_failure: None,
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.trials_permitted = 0;
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure = Some(now);
        self.success_count = 0;
        self.trials_permitted = 0;
    }
}

/// Circuit breaker protecting one downstream dependency
///
/// # Example
/// ```
/// use sluice_core_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     failure_threshold: 2,
///     recovery_timeout: Duration::from_secs(10),
///     half_open_trial_limit: 1,
/// })
/// .unwrap();
///
/// if breaker.can_execute() {
///     // call the dependency, then report
///     breaker.record_failure();
/// }
/// breaker.record_failure();
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(!breaker.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, system_clock())
    }

    /// Create a breaker reading time from `clock`
    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: "downstream".to_string(),
            config,
            state: Mutex::new(BreakerState::new()),
            clock,
        })
    }

    /// Label the protected dependency in log output
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call may proceed.
    ///
    /// May move Open→HalfOpen once the recovery timeout has passed, and
    /// consumes a trial permit while half-open.
    pub fn can_execute(&self) -> bool {
        self.try_acquire().is_some()
    }

    /// Like [`can_execute`](Self::can_execute), but reports whether the call
    /// holds a trial slot
    pub fn try_acquire(&self) -> Option<Permit> {
        let now = self.clock.now();
        let mut st = self.lock();

        if st.state == CircuitState::Open {
            let elapsed = st
                .last_failure
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if elapsed <= self.config.recovery_timeout {
                return None;
            }
            st.state = CircuitState::HalfOpen;
            st.success_count = 0;
            st.trials_permitted = 0;
            st.episode += 1;
            info!(breaker = %self.name, episode = st.episode, "Circuit half-open, admitting trial calls");
        }

        match st.state {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::HalfOpen => {
                if st.trials_permitted < self.config.half_open_trial_limit {
                    st.trials_permitted += 1;
                    Some(Permit::Trial {
                        episode: st.episode,
                    })
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Report a successful call
    pub fn record_success(&self) {
        let mut st = self.lock();
        self.on_success(&mut st);
    }

    /// Report a failed call
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut st = self.lock();
        self.on_failure(&mut st, now);
    }

    /// Report the result of a call made under `permit`.
    ///
    /// While half-open only trial permits of the current episode count.
    /// Results of calls admitted before the trip say nothing about
    /// recovery and are dropped.
    pub fn record_outcome(&self, permit: Permit, success: bool) {
        let now = self.clock.now();
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen && !self.is_current_trial(&st, permit) {
            debug!(breaker = %self.name, ?permit, success, "Ignoring non-trial result while half-open");
            return;
        }
        if success {
            self.on_success(&mut st);
        } else {
            self.on_failure(&mut st, now);
        }
    }

    /// Give back a permit whose call never reached the dependency.
    ///
    /// Frees a trial slot only if `permit` belongs to the half-open episode
    /// still in progress. Normal permits and stale trials are no-ops.
    pub fn record_abandoned(&self, permit: Permit) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen && self.is_current_trial(&st, permit) {
            st.trials_permitted = st.trials_permitted.saturating_sub(1);
        }
    }

    fn is_current_trial(&self, st: &BreakerState, permit: Permit) -> bool {
        matches!(permit, Permit::Trial { episode } if episode == st.episode)
    }

    fn on_success(&self, st: &mut BreakerState) {
        match st.state {
            CircuitState::Closed => {
                st.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.half_open_trial_limit {
                    st.close();
                    info!(breaker = %self.name, "Circuit closed, dependency recovered");
                }
            }
            CircuitState::Open => {
                // Late result from a call admitted before the trip
                debug!(breaker = %self.name, "Ignoring success reported while open");
            }
        }
    }

    fn on_failure(&self, st: &mut BreakerState, now: Instant) {
        match st.state {
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.config.failure_threshold {
                    st.open(now);
                    warn!(
                        breaker = %self.name,
                        failures = st.failure_count,
                        recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                st.open(now);
                warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Ignoring failure reported while open");
            }
        }
    }

    /// Current state, without evaluating the recovery timeout
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let st = self.lock();
        let open_remaining = match (st.state, st.last_failure) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(now.saturating_duration_since(at)),
            ),
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            trials_permitted: st.trials_permitted,
            open_remaining,
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        self.lock().close();
        info!(breaker = %self.name, "Circuit manually reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn breaker(threshold: u32, timeout_ms: u64, trials: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(timeout_ms),
                half_open_trial_limit: trials,
            },
            Arc::new(clock.clone()),
        )
        .unwrap();
        (breaker, clock)
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());

        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidFailureThreshold));

        let cfg = CircuitBreakerConfig {
            half_open_trial_limit: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidTrialLimit));
    }

    #[test]
    fn test_circuit_breaker_closed_to_open() {
        let (breaker, _clock) = breaker(3, 1_000, 1);

        for _ in 0..2 {
            assert!(breaker.can_execute());
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_success_resets_failures_while_closed() {
        let (breaker, _clock) = breaker(3, 1_000, 1);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_until_timeout_strictly_passes() {
        let (breaker, clock) = breaker(1, 500, 1);
        breaker.record_failure();

        clock.advance(Duration::from_millis(499));
        assert!(!breaker.can_execute());
        clock.advance(Duration::from_millis(1));
        assert!(!breaker.can_execute()); // elapsed == timeout is not enough
        clock.advance(Duration::from_millis(1));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_limits_trials() {
        let (breaker, clock) = breaker(1, 100, 2);
        breaker.record_failure();
        clock.advance(Duration::from_millis(101));

        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
        assert_eq!(breaker.snapshot().trials_permitted, 2);
    }

    #[test]
    fn test_circuit_breaker_half_open_to_closed() {
        let (breaker, clock) = breaker(2, 50, 2);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_millis(60));

        for _ in 0..2 {
            assert!(breaker.can_execute());
            breaker.record_success();
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_single_half_open_failure_reopens() {
        let (breaker, clock) = breaker(1, 100, 3);
        breaker.record_failure();
        clock.advance(Duration::from_millis(101));

        assert!(breaker.can_execute());
        breaker.record_success();
        assert!(breaker.can_execute());
        breaker.record_success();
        assert!(breaker.can_execute());
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.success_count(), 0);
        // New failure timestamp: a fresh full timeout is required
        clock.advance(Duration::from_millis(100));
        assert!(!breaker.can_execute());
        clock.advance(Duration::from_millis(1));
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_abandoned_trial_frees_slot() {
        let (breaker, clock) = breaker(1, 10, 1);
        breaker.record_failure();
        clock.advance(Duration::from_millis(11));

        let permit = breaker.try_acquire().unwrap();
        assert!(permit.is_trial());
        assert!(!breaker.can_execute());
        breaker.record_abandoned(permit);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_normal_permit_abandoned_in_half_open_keeps_trial_slot() {
        let (breaker, clock) = breaker(1, 0, 1);

        // Admitted while closed, no trial slot taken
        let early = breaker.try_acquire().unwrap();
        assert_eq!(early, Permit::Normal);

        // Trip and recover before the early caller finishes
        breaker.record_failure();
        clock.advance(Duration::from_millis(1));
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());

        breaker.record_abandoned(early);
        assert!(!breaker.can_execute(), "second concurrent trial let through");
        assert_eq!(breaker.snapshot().trials_permitted, 1);
    }

    #[test]
    fn test_stale_trial_abandoned_in_later_episode_is_ignored() {
        let (breaker, clock) = breaker(1, 0, 1);
        breaker.record_failure();
        clock.advance(Duration::from_millis(1));
        let first = breaker.try_acquire().unwrap();

        // Episode ends with a failed trial, a new one starts
        breaker.record_outcome(first, false);
        clock.advance(Duration::from_millis(1));
        let second = breaker.try_acquire().unwrap();
        assert_ne!(first, second);

        breaker.record_abandoned(first);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_late_normal_success_does_not_close_half_open() {
        let (breaker, clock) = breaker(1, 0, 1);
        let early = breaker.try_acquire().unwrap();
        breaker.record_failure();
        clock.advance(Duration::from_millis(1));
        let trial = breaker.try_acquire().unwrap();

        breaker.record_outcome(early, true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_outcome(trial, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_results_ignored_while_open() {
        let (breaker, _clock) = breaker(1, 1_000, 1);
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_snapshot_reports_open_remaining() {
        let (breaker, clock) = breaker(1, 1_000, 1);
        assert_eq!(breaker.snapshot().open_remaining, None);

        breaker.record_failure();
        clock.advance(Duration::from_millis(400));
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.open_remaining, Some(Duration::from_millis(600)));
    }

    #[test]
    fn test_reset() {
        let (breaker, _clock) = breaker(1, 1_000, 1);
        breaker.record_failure();
        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_concurrent_failures_trip_exactly_once() {
        let (breaker, _clock) = breaker(40, 60_000, 1);
        let breaker = Arc::new(breaker);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        breaker.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 40);
    }
}
