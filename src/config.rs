/*!
 * Configuration types for Sluice
 *
 * A `SluiceConfig` is loaded once at startup (usually from TOML), validated
 * once, and converted into the core component configurations. Nothing is
 * re-validated per request.
 */

use crate::error::{Result, SluiceError};
use serde::{Deserialize, Serialize};
use sluice_core_resilience::{
    CircuitBreakerConfig, OverloadMetric, Priority, SchedulerConfig, TokenBucketConfig,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a request gate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Per-key admission quotas
    #[serde(default)]
    pub rate_limiter: RateLimiterSection,

    /// Downstream failure isolation
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    /// Priority classes, weights and shedding
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Dispatch loop sizing
    #[serde(default)]
    pub dispatch: DispatchSection,

    /// Diagnostic output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[rate_limiter]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSection {
    /// Bucket capacity (burst size) for keys without an override
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Tokens refilled per second for keys without an override
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_second: f64,

    /// Key-specific bucket shapes, e.g. `[rate_limiter.overrides.premium]`
    #[serde(default)]
    pub overrides: BTreeMap<String, TokenBucketConfig>,
}

impl Default for RateLimiterSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate_per_second: default_refill_rate(),
            overrides: BTreeMap::new(),
        }
    }
}

impl RateLimiterSection {
    pub fn bucket(&self) -> TokenBucketConfig {
        TokenBucketConfig {
            capacity: self.capacity,
            refill_rate_per_second: self.refill_rate_per_second,
        }
    }
}

/// `[circuit_breaker]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Milliseconds the circuit stays open before probing
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Trial calls let through while half-open
    #[serde(default = "default_trial_limit")]
    pub half_open_trial_limit: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_trial_limit: default_trial_limit(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            half_open_trial_limit: self.half_open_trial_limit,
        }
    }
}

/// A value per priority class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassTable<V> {
    pub p0: V,
    pub p1: V,
    pub p2: V,
    pub p3: V,
}

impl<V: Copy> ClassTable<V> {
    pub fn get(&self, priority: Priority) -> V {
        match priority {
            Priority::P0 => self.p0,
            Priority::P1 => self.p1,
            Priority::P2 => self.p2,
            Priority::P3 => self.p3,
        }
    }

    pub fn to_array(&self) -> [V; Priority::COUNT] {
        [self.p0, self.p1, self.p2, self.p3]
    }
}

/// `[scheduler]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Measurement compared against the shed thresholds
    #[serde(default)]
    pub metric: OverloadMetric,

    /// Latency samples kept by the overload signal
    #[serde(default = "default_window")]
    pub window: usize,

    /// Dispatch share per class; must sum to 1.0
    #[serde(default = "default_weights")]
    pub weights: ClassTable<f64>,

    /// Overload value above which a class is shed; omit a class to never shed it
    #[serde(default = "default_shed_thresholds")]
    pub shed_thresholds: ClassTable<Option<f64>>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            metric: OverloadMetric::default(),
            window: default_window(),
            weights: default_weights(),
            shed_thresholds: default_shed_thresholds(),
        }
    }
}

impl SchedulerSection {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            weights: self.weights.to_array(),
            shed_thresholds: self.shed_thresholds.to_array(),
            metric: self.metric,
        }
    }
}

/// `[dispatch]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSection {
    /// Dispatcher tasks pulling from the scheduler
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_capacity() -> u32 {
    100
}

fn default_refill_rate() -> f64 {
    10.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_trial_limit() -> u32 {
    2
}

fn default_window() -> usize {
    256
}

fn default_weights() -> ClassTable<f64> {
    let [p0, p1, p2, p3] = SchedulerConfig::default().weights;
    ClassTable { p0, p1, p2, p3 }
}

fn default_shed_thresholds() -> ClassTable<Option<f64>> {
    let [p0, p1, p2, p3] = SchedulerConfig::default().shed_thresholds;
    ClassTable { p0, p1, p2, p3 }
}

fn default_workers() -> usize {
    1
}

impl SluiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| SluiceError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate every section. Called once, before any traffic is accepted.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiter.bucket().validate()?;
        for bucket in self.rate_limiter.overrides.values() {
            bucket.validate()?;
        }
        self.circuit_breaker.breaker().validate()?;
        self.scheduler.scheduler().validate()?;
        if self.scheduler.window == 0 {
            return Err(sluice_core_resilience::ConfigError::InvalidWindow.into());
        }
        if self.dispatch.workers == 0 {
            return Err(sluice_core_resilience::ConfigError::Invalid(
                "dispatch.workers must be at least 1".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
