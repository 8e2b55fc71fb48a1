/*!
 * Error types for Sluice
 *
 * Only setup can fail: loading and validating configuration, and installing
 * the log subscriber. Request rejections are `SubmitOutcome` values.
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use sluice_core_resilience::ConfigError;

pub type Result<T> = std::result::Result<T, SluiceError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum SluiceError {
    /// A component rejected its configuration
    #[error("Invalid {section} configuration: {0}", section = .0.section())]
    Config(#[from] ConfigError),

    /// Configuration file could not be read
    #[error("Failed to read configuration file {file}: {source}", file = .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration file is not valid TOML for this schema
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be rendered back to TOML
    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Log subscriber setup failed
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A dispatcher task ended abnormally
    #[error("Dispatcher task failed: {0}")]
    Dispatcher(String),
}

impl SluiceError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SluiceError::Config(_)
            | SluiceError::ConfigRead { .. }
            | SluiceError::ConfigParse(_)
            | SluiceError::ConfigSerialize(_)
            | SluiceError::Logging(_) => EXIT_FATAL,
            SluiceError::Io(_) | SluiceError::Dispatcher(_) => EXIT_PARTIAL,
        }
    }

    /// Whether the error stems from configuration the operator can fix
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SluiceError::Config(_) | SluiceError::ConfigRead { .. } | SluiceError::ConfigParse(_)
        )
    }
}
