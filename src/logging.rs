/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{Result, SluiceError};

/// Level actually applied for a logging configuration
pub fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// Build the filter: `RUST_LOG` wins, otherwise both sluice crates at the configured level
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let level = effective_level(config);
    EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "sluice={level},sluice_core_resilience={level}"
            ))
        })
        .map_err(|e| SluiceError::Logging(format!("Failed to create log filter: {}", e)))
}

/// Initialize structured logging based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(config)?;

    if let Some(ref log_path) = config.file {
        init_file_logging(log_path, env_filter)?;
    } else {
        init_stdout_logging(env_filter)?;
    }

    Ok(())
}

fn init_stdout_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| SluiceError::Logging(e.to_string()))
}

/// JSON lines, one event per line, no ANSI colors
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path).map_err(|e| {
        SluiceError::Logging(format!(
            "Failed to create log file {}: {}",
            log_path.display(),
            e
        ))
    })?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| SluiceError::Logging(e.to_string()))
}

/// Route log output to the test harness. Safe to call from every test.
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("sluice=debug,sluice_core_resilience=debug")
        });

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}
