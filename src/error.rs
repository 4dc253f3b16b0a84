/*!
 * Error types for the selector runtime
 */

use dpf_core_selector::SelectorError;
use dpf_observability::ObservabilityError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DpfError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Error, Debug)]
pub enum DpfError {
    /// Selection or lifecycle rejection from the core
    #[error(transparent)]
    Selector(#[from] SelectorError),

    /// Configuration file or value is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] ObservabilityError),

    /// The secret named by an instance's `auth_key` could not be resolved
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// A transfer ended in `Failed` after all attempts
    #[error("Transfer {transfer_id} failed after {attempts} attempt(s): {reason}")]
    TransferFailed {
        transfer_id: String,
        attempts: u32,
        reason: String,
    },

    /// A transfer was cancelled while being orchestrated
    #[error("Transfer {0} was cancelled")]
    TransferCancelled(String),
}

impl DpfError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            DpfError::Config(_)
            | DpfError::ConfigParse(_)
            | DpfError::Io(_)
            | DpfError::Metrics(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// The core error, if this wraps one
    pub fn as_selector(&self) -> Option<&SelectorError> {
        match self {
            DpfError::Selector(e) => Some(e),
            _ => None,
        }
    }
}
