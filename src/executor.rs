/*!
 * Downstream execution seam
 *
 * The gate never runs work itself. A dispatcher hands each dequeued request
 * to an `Executor` and feeds the resulting report back into the circuit
 * breaker and the overload signal.
 */

use async_trait::async_trait;
use sluice_core_resilience::QueuedRequest;
use std::time::Duration;

/// How a downstream call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Success,
    Failure,
}

/// Outcome and observed latency of one downstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    pub result: ExecutionResult,
    pub latency: Duration,
}

impl ExecutionReport {
    pub fn success(latency: Duration) -> Self {
        Self {
            result: ExecutionResult::Success,
            latency,
        }
    }

    pub fn failure(latency: Duration) -> Self {
        Self {
            result: ExecutionResult::Failure,
            latency,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == ExecutionResult::Success
    }
}

/// Runs admitted requests against the protected dependency
#[async_trait]
pub trait Executor<T>: Send + Sync {
    async fn execute(&self, request: &QueuedRequest<T>) -> ExecutionReport;
}
