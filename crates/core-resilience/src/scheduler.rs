//! Priority scheduler: deficit round robin dispatch with threshold shedding
//!
//! Admitted requests wait in one FIFO per [`Priority`] class. Dispatch order
//! across classes follows deficit round robin: every dispatch decision
//! credits each non-empty class with its share of one dispatch, the class
//! holding the largest positive deficit is served, and its deficit is debited
//! by one. Over any window where classes stay backlogged, each class receives
//! a share of dispatches proportional to its weight, and every class with a
//! non-zero weight is served within a bounded number of dispatches.
//!
//! Before admitting a request the scheduler reads the overload signal. If the
//! signal is above the threshold configured for the request's class, the
//! request is shed and never queued. Lower classes are given lower thresholds
//! so the cheapest work goes first as load rises.
//!
//! # Example
//!
//! ```
//! use sluice_core_resilience::overload::OverloadSignal;
//! use sluice_core_resilience::request::{Priority, Request};
//! use sluice_core_resilience::scheduler::{Enqueued, PriorityScheduler, SchedulerConfig};
//! use std::sync::Arc;
//!
//! let signal = Arc::new(OverloadSignal::new(128).unwrap());
//! let scheduler = PriorityScheduler::new(SchedulerConfig::default(), signal).unwrap();
//!
//! let outcome = scheduler.enqueue(Request::new("tenant-a", Priority::P1, "payload"));
//! assert!(matches!(outcome, Enqueued::Accepted(_)));
//!
//! let next = scheduler.try_dequeue().unwrap();
//! assert_eq!(next.payload, "payload");
//! ```

use crate::clock::{system_clock, SharedClock};
use crate::error::ConfigError;
use crate::overload::{OverloadMetric, OverloadSignal};
use crate::request::{Priority, QueuedRequest, Request, RequestId};
use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Weights must sum to 1.0 within this tolerance
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Per-class dispatch weights and shed thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Dispatch share per class, indexed by [`Priority::index`]. Must sum to 1.0.
    pub weights: [f64; Priority::COUNT],

    /// Overload value above which new requests of the class are shed.
    /// `None` means the class is never shed.
    pub shed_thresholds: [Option<f64>; Priority::COUNT],

    /// Which measurement the thresholds are compared against
    pub metric: OverloadMetric,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: [0.4, 0.3, 0.2, 0.1],
            shed_thresholds: [None, Some(2_000.0), Some(1_000.0), Some(500.0)],
            metric: OverloadMetric::P99LatencyMs,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for priority in Priority::ALL {
            let weight = self.weights[priority.index()];
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    class: priority.to_string(),
                    weight,
                });
            }
            if let Some(threshold) = self.shed_thresholds[priority.index()] {
                if threshold.is_nan() || threshold < 0.0 {
                    return Err(ConfigError::InvalidShedThreshold {
                        class: priority.to_string(),
                        threshold,
                    });
                }
            }
        }

        let sum: f64 = self.weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightsNotNormalized { sum });
        }
        Ok(())
    }

    /// Whether lower classes never shed later than higher ones
    pub fn thresholds_are_monotonic(&self) -> bool {
        let effective: Vec<f64> = self
            .shed_thresholds
            .iter()
            .map(|t| t.unwrap_or(f64::INFINITY))
            .collect();
        effective.windows(2).all(|pair| pair[0] >= pair[1])
    }
}

/// Result of [`PriorityScheduler::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Queued for dispatch under this id
    Accepted(RequestId),
    /// Rejected by the shedding policy (or the scheduler is closed)
    Shed,
}

#[derive(Debug)]
struct SchedulerState<T> {
    /// Ids in arrival order. May hold ids of cancelled requests, skipped lazily.
    queues: [VecDeque<RequestId>; Priority::COUNT],
    /// Live (not cancelled) requests per class
    live: [usize; Priority::COUNT],
    deficits: [f64; Priority::COUNT],
    shedding: [bool; Priority::COUNT],
    entries: HashMap<RequestId, QueuedRequest<T>>,
    next_id: u64,
    closed: bool,
}

impl<T> SchedulerState<T> {
    fn new() -> Self {
        Self {
            queues: Default::default(),
            live: [0; Priority::COUNT],
            deficits: [0.0; Priority::COUNT],
            shedding: [false; Priority::COUNT],
            entries: HashMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    fn total_live(&self) -> usize {
        self.live.iter().sum()
    }

    fn mark_removed(&mut self, class: usize) {
        debug_assert!(self.live[class] > 0, "live count underflow for class {}", class);
        self.live[class] -= 1;
        if self.live[class] == 0 {
            // An idle class keeps no credit or debt
            self.queues[class].clear();
            self.deficits[class] = 0.0;
        } else if self.queues[class].len() > 2 * self.live[class] + 16 {
            let entries = &self.entries;
            self.queues[class].retain(|id| entries.contains_key(id));
        }
        debug_assert_eq!(self.total_live(), self.entries.len());
    }
}

/// Weighted fair scheduler over the four priority classes
#[derive(Debug)]
pub struct PriorityScheduler<T> {
    config: SchedulerConfig,
    signal: Arc<OverloadSignal>,
    state: Mutex<SchedulerState<T>>,
    notify: Notify,
    clock: SharedClock,
}

impl<T> PriorityScheduler<T> {
    /// Create a scheduler reading overload from `signal`
    pub fn new(config: SchedulerConfig, signal: Arc<OverloadSignal>) -> Result<Self, ConfigError> {
        Self::with_clock(config, signal, system_clock())
    }

    pub fn with_clock(
        config: SchedulerConfig,
        signal: Arc<OverloadSignal>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if !config.thresholds_are_monotonic() {
            warn!("Shed thresholds are not monotonic: a higher class may shed before a lower one");
        }
        Ok(Self {
            config,
            signal,
            state: Mutex::new(SchedulerState::new()),
            notify: Notify::new(),
            clock,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn signal(&self) -> &Arc<OverloadSignal> {
        &self.signal
    }

    /// Queue a request unless its class is currently being shed
    pub fn enqueue(&self, request: Request<T>) -> Enqueued {
        let class = request.priority.index();
        let latency_ms = match self.config.metric {
            OverloadMetric::P99LatencyMs => Some(self.signal.p99_ms()),
            OverloadMetric::QueueDepth => None,
        };

        let mut st = self.lock();
        if st.closed {
            debug!(priority = %request.priority, "Scheduler closed, rejecting request");
            return Enqueued::Shed;
        }

        let overload = latency_ms.unwrap_or(st.total_live() as f64);
        let shed = self.config.shed_thresholds[class].is_some_and(|limit| overload > limit);
        if shed {
            if !st.shedding[class] {
                st.shedding[class] = true;
                warn!(
                    priority = %request.priority,
                    metric = %self.config.metric,
                    overload,
                    threshold = self.config.shed_thresholds[class],
                    "Shedding priority class"
                );
            }
            return Enqueued::Shed;
        }
        if st.shedding[class] {
            st.shedding[class] = false;
            info!(priority = %request.priority, overload, "Priority class no longer shed");
        }

        let id = RequestId(st.next_id);
        st.next_id += 1;
        st.queues[class].push_back(id);
        st.live[class] += 1;
        st.entries.insert(
            id,
            QueuedRequest {
                id,
                key: request.key,
                priority: request.priority,
                enqueued_at: self.clock.now(),
                payload: request.payload,
            },
        );
        drop(st);

        self.notify.notify_one();
        Enqueued::Accepted(id)
    }

    /// Take the next request in weighted order, or `None` if nothing waits
    pub fn try_dequeue(&self) -> Option<QueuedRequest<T>> {
        let mut st = self.lock();
        self.pop_next(&mut st)
    }

    /// Wait for the next request.
    ///
    /// Returns `None` once the scheduler is closed and fully drained.
    pub async fn dequeue(&self) -> Option<QueuedRequest<T>> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(request) = self.pop_next(&mut st) {
                    return Some(request);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Withdraw a waiting request. Returns `None` if it was already dispatched.
    pub fn cancel(&self, id: RequestId) -> Option<QueuedRequest<T>> {
        let mut st = self.lock();
        let request = st.entries.remove(&id)?;
        st.mark_removed(request.priority.index());
        debug!(id = %id, priority = %request.priority, "Request cancelled");
        Some(request)
    }

    /// Stop accepting work and wake every waiting dispatcher.
    /// Requests already queued can still be dequeued.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Requests waiting across all classes
    pub fn len(&self) -> usize {
        self.lock().total_live()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests waiting in one class
    pub fn depth(&self, priority: Priority) -> usize {
        self.lock().live[priority.index()]
    }

    /// Current deficit counters, indexed by class
    pub fn deficits(&self) -> [f64; Priority::COUNT] {
        self.lock().deficits
    }

    fn pop_next(&self, st: &mut SchedulerState<T>) -> Option<QueuedRequest<T>> {
        let class = self.select_class(st)?;
        while let Some(id) = st.queues[class].pop_front() {
            if let Some(request) = st.entries.remove(&id) {
                st.mark_removed(class);
                return Some(request);
            }
        }
        debug_assert!(false, "class {} had live requests but an empty queue", class);
        None
    }

    fn select_class(&self, st: &mut SchedulerState<T>) -> Option<usize> {
        let active: Vec<usize> = (0..Priority::COUNT).filter(|&c| st.live[c] > 0).collect();
        let first = *active.first()?;

        let active_weight: f64 = active.iter().map(|&c| self.config.weights[c]).sum();
        if active_weight <= 0.0 {
            // Only zero-weight classes have work; serve them in class order
            return Some(first);
        }

        // Credit each backlogged class with its share of this dispatch until
        // one of them holds positive credit.
        loop {
            for &c in &active {
                st.deficits[c] += self.config.weights[c] / active_weight;
            }
            if active.iter().any(|&c| st.deficits[c] > 0.0) {
                break;
            }
        }

        let mut chosen = first;
        for &c in &active[1..] {
            if st.deficits[c] > st.deficits[chosen] {
                chosen = c;
            }
        }
        st.deficits[chosen] -= 1.0;
        Some(chosen)
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
