//! Request types flowing through admission and scheduling

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Priority class. P0 is the most valuable work and is shed last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    /// Number of priority classes
    pub const COUNT: usize = 4;

    /// All classes, highest priority first
    pub const ALL: [Priority; Priority::COUNT] =
        [Priority::P0, Priority::P1, Priority::P2, Priority::P3];

    /// Numeric class value, also the index into per-class tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "p0",
            Priority::P1 => "p1",
            Priority::P2 => "p2",
            Priority::P3 => "p3",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p0" | "0" => Ok(Priority::P0),
            "p1" | "1" => Ok(Priority::P1),
            "p2" | "2" => Ok(Priority::P2),
            "p3" | "3" => Ok(Priority::P3),
            other => Err(format!("unknown priority class '{}'", other)),
        }
    }
}

/// Identifier assigned to a request when the scheduler accepts it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A unit of work as submitted by a caller
#[derive(Debug, Clone)]
pub struct Request<T> {
    /// Admission key charged by the rate limiter
    pub key: String,
    pub priority: Priority,
    /// Tokens charged by the rate limiter
    pub cost: u32,
    pub payload: T,
}

impl<T> Request<T> {
    pub fn new(key: impl Into<String>, priority: Priority, payload: T) -> Self {
        Self {
            key: key.into(),
            priority,
            cost: 1,
            payload,
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

/// A request owned by the scheduler, waiting for or handed to dispatch
#[derive(Debug, Clone)]
pub struct QueuedRequest<T> {
    pub id: RequestId,
    pub key: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub payload: T,
}
