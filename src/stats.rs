/*!
 * Gate statistics
 *
 * Counters are plain relaxed atomics: they are observational and never feed
 * back into an admission decision.
 */

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a `RequestGate`
#[derive(Debug, Default)]
pub struct GateStats {
    submitted: AtomicU64,
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    shed: AtomicU64,
    cancelled: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl GateStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_submitted => submitted,
        record_admitted => admitted,
        record_rate_limited => rate_limited,
        record_circuit_open => circuit_open,
        record_shed => shed,
        record_cancelled => cancelled,
        record_dispatched => dispatched,
        record_succeeded => succeeded,
        record_failed => failed,
    }

    pub fn snapshot(&self) -> GateStatsSnapshot {
        GateStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the gate counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStatsSnapshot {
    pub submitted: u64,
    pub admitted: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub shed: u64,
    pub cancelled: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl GateStatsSnapshot {
    /// Submissions turned away before reaching the queue
    pub fn rejected(&self) -> u64 {
        self.rate_limited + self.circuit_open + self.shed
    }

    /// Fraction of submissions admitted, 0.0 when nothing was submitted
    pub fn admission_rate(&self) -> f64 {
        if self.submitted == 0 {
            0.0
        } else {
            self.admitted as f64 / self.submitted as f64
        }
    }

    /// Human-readable multi-line report
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str("Sluice Gate Statistics\n");
        out.push_str("======================\n");
        out.push_str(&format!("Submitted:     {}\n", self.submitted));
        out.push_str(&format!(
            "Admitted:      {} ({:.1}%)\n",
            self.admitted,
            self.admission_rate() * 100.0
        ));
        out.push_str(&format!("Rate limited:  {}\n", self.rate_limited));
        out.push_str(&format!("Circuit open:  {}\n", self.circuit_open));
        out.push_str(&format!("Shed:          {}\n", self.shed));
        out.push_str(&format!("Cancelled:     {}\n", self.cancelled));
        out.push_str(&format!("Dispatched:    {}\n", self.dispatched));
        out.push_str(&format!("  Succeeded:   {}\n", self.succeeded));
        out.push_str(&format!("  Failed:      {}\n", self.failed));
        out
    }
}
