//! Error types for the resilience primitives
//!
//! Only construction can fail. Rejections at runtime (rate limited, circuit
//! open, shed) are ordinary return values, not errors.

use thiserror::Error;

/// Configuration rejected at construction time
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Bucket capacity must hold at least one token
    #[error("Token bucket capacity must be at least 1, got {0}")]
    InvalidCapacity(u32),

    /// Refill rate must be finite and strictly positive
    #[error("Refill rate must be a positive finite number, got {0}")]
    InvalidRefillRate(f64),

    /// Breaker must trip on at least one failure
    #[error("Circuit breaker failure threshold must be at least 1")]
    InvalidFailureThreshold,

    /// Half-open state must let at least one trial call through
    #[error("Circuit breaker half-open trial limit must be at least 1")]
    InvalidTrialLimit,

    /// A class weight was negative or not finite
    #[error("Weight for priority class {class} must be a non-negative finite number, got {weight}")]
    InvalidWeight { class: String, weight: f64 },

    /// Class weights must describe a distribution
    #[error("Priority class weights must sum to 1.0, got {sum}")]
    WeightsNotNormalized { sum: f64 },

    /// A shed threshold was negative or NaN
    #[error("Shed threshold for priority class {class} must be non-negative, got {threshold}")]
    InvalidShedThreshold { class: String, threshold: f64 },

    /// Overload sample window must hold at least one sample
    #[error("Overload signal window must hold at least 1 sample")]
    InvalidWindow,

    /// Generic validation failure
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Name of the configuration section the error belongs to
    pub fn section(&self) -> &'static str {
        match self {
            ConfigError::InvalidCapacity(_) | ConfigError::InvalidRefillRate(_) => "rate_limiter",
            ConfigError::InvalidFailureThreshold | ConfigError::InvalidTrialLimit => {
                "circuit_breaker"
            }
            ConfigError::InvalidWeight { .. }
            | ConfigError::WeightsNotNormalized { .. }
            | ConfigError::InvalidShedThreshold { .. }
            | ConfigError::InvalidWindow => "scheduler",
            ConfigError::Invalid(_) => "general",
        }
    }
}
