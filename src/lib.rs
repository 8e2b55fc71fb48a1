/*!
 * Sluice - request resilience control layer
 *
 * Sits between callers and a protected downstream dependency and decides,
 * per request, whether to admit, queue, reject or shed it:
 * - Per-key token bucket rate limiting
 * - Circuit breaking on consecutive downstream failures
 * - Deficit round robin across four priority classes
 * - Threshold load shedding driven by p99 latency or queue depth
 * - Cancellation of queued requests before dispatch
 *
 * The primitives live in `sluice-core-resilience`; this crate composes them
 * into a `RequestGate`, runs dispatchers on tokio and loads configuration.
 */

pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod logging;
pub mod simulate;
pub mod stats;

// Re-export commonly used types
pub use config::SluiceConfig;
pub use error::{Result, SluiceError};
pub use executor::{ExecutionReport, ExecutionResult, Executor};
pub use gate::{DispatcherPool, RequestGate, SubmitOutcome};
pub use stats::GateStatsSnapshot;

pub use sluice_core_resilience as resilience;
pub use sluice_core_resilience::{
    CircuitState, ManualClock, Priority, QueuedRequest, Request, RequestId,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
