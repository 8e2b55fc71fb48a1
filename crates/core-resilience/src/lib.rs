//! Sluice Core Resilience: Pure-logic admission control primitives
//!
//! # Overview
//!
//! This crate provides the building blocks Sluice composes into its request
//! gate. It includes:
//!
//! - **Rate Limiter**: Keyed token buckets deciding per-caller admission
//! - **Circuit Breaker**: Fails fast while a downstream dependency is unhealthy
//! - **Priority Scheduler**: Deficit round robin over four priority classes
//! - **Overload Signal**: Rolling p99 latency driving load shedding
//! - **Clock**: Injectable monotonic time for deterministic tests
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transports (HTTP, gRPC, queues)
//! - The downstream executor that actually runs requests
//! - Application-specific concerns
//!
//! Every component is an owned instance with its own lock. Nothing here is
//! process-global, so independent keys, dependencies and classes never
//! contend with each other.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Caller (submit)                 │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Per-key quotas
//! │  (Token bucket per admission key)       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Priority Scheduler                │  ← Shedding + fair dispatch
//! │  (Thresholds per class, DRR ordering)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Dispatch loop → Executor
//!               │
//!        outcome + latency
//!               │
//!               ▼
//!   Circuit Breaker / Overload Signal
//! ```
//!
//! # Usage Example
//!
//! ```
//! use sluice_core_resilience::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(TokenBucketConfig {
//!     capacity: 10,
//!     refill_rate_per_second: 1.0,
//! })
//! .unwrap();
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     failure_threshold: 3,
//!     recovery_timeout: Duration::from_secs(5),
//!     half_open_trial_limit: 1,
//! })
//! .unwrap();
//! let signal = Arc::new(OverloadSignal::new(256).unwrap());
//! let scheduler = PriorityScheduler::new(SchedulerConfig::default(), Arc::clone(&signal)).unwrap();
//!
//! if breaker.can_execute() && limiter.allow("tenant-a", 1) {
//!     scheduler.enqueue(Request::new("tenant-a", Priority::P0, 7u32));
//! }
//!
//! let next = scheduler.try_dequeue().unwrap();
//! breaker.record_success();
//! signal.record_latency(Duration::from_millis(12));
//! assert_eq!(next.payload, 7);
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod overload;
pub mod rate_limiter;
pub mod request;
pub mod scheduler;

// Re-export main types for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, Permit,
};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::ConfigError;
pub use overload::{OverloadMetric, OverloadSignal};
pub use rate_limiter::{RateLimiter, TokenBucketConfig};
pub use request::{Priority, QueuedRequest, Request, RequestId};
pub use scheduler::{Enqueued, PriorityScheduler, SchedulerConfig};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use sluice_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit};
    pub use super::clock::{Clock, ManualClock, SystemClock};
    pub use super::error::ConfigError;
    pub use super::overload::{OverloadMetric, OverloadSignal};
    pub use super::rate_limiter::{RateLimiter, TokenBucketConfig};
    pub use super::request::{Priority, QueuedRequest, Request, RequestId};
    pub use super::scheduler::{Enqueued, PriorityScheduler, SchedulerConfig};
}
