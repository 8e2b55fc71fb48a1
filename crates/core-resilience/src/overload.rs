//! Overload signal: rolling dispatch latency feeding the shedding policy
//!
//! The gate records the latency of every completed dispatch; the scheduler
//! reads the signal before admitting a request. The signal keeps the last
//! `window` samples and maintains their p99 on write so reads stay cheap on
//! the hot enqueue path.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What the scheduler compares against per-class shed thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadMetric {
    /// p99 dispatch latency over the sample window, in milliseconds
    #[default]
    P99LatencyMs,
    /// Total number of requests waiting across all classes
    QueueDepth,
}

impl std::fmt::Display for OverloadMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverloadMetric::P99LatencyMs => write!(f, "p99_latency_ms"),
            OverloadMetric::QueueDepth => write!(f, "queue_depth"),
        }
    }
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<Duration>,
    p99: Duration,
    total_recorded: u64,
}

/// Rolling latency measurement shared by the gate and the scheduler
#[derive(Debug)]
pub struct OverloadSignal {
    capacity: usize,
    window: Mutex<Window>,
}

impl OverloadSignal {
    /// Keep the most recent `window` samples
    pub fn new(window: usize) -> Result<Self, ConfigError> {
        if window == 0 {
            return Err(ConfigError::InvalidWindow);
        }
        Ok(Self {
            capacity: window,
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(window),
                p99: Duration::ZERO,
                total_recorded: 0,
            }),
        })
    }

    /// Feed the latency observed for one dispatch
    pub fn record_latency(&self, latency: Duration) {
        let mut w = self.lock();
        w.samples.push_back(latency);
        while w.samples.len() > self.capacity {
            w.samples.pop_front();
        }
        w.total_recorded += 1;
        w.p99 = p99(&w.samples);
    }

    /// p99 latency over the current window, zero when no samples exist
    pub fn p99(&self) -> Duration {
        self.lock().p99
    }

    /// p99 latency in fractional milliseconds
    pub fn p99_ms(&self) -> f64 {
        self.p99().as_nanos() as f64 / 1_000_000.0
    }

    /// Samples currently in the window
    pub fn sample_count(&self) -> usize {
        self.lock().samples.len()
    }

    /// Samples recorded since creation
    pub fn total_recorded(&self) -> u64 {
        self.lock().total_recorded
    }

    pub fn window_size(&self) -> usize {
        self.capacity
    }

    /// Drop all samples, e.g. after the downstream was replaced
    pub fn clear(&self) {
        let mut w = self.lock();
        w.samples.clear();
        w.p99 = Duration::ZERO;
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Nearest-rank 99th percentile
fn p99(samples: &VecDeque<Duration>) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = (sorted.len() * 99).div_ceil(100);
    sorted[rank.clamp(1, sorted.len()) - 1]
}
