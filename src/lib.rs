/*!
 * dpf-selector - data-plane selection and transfer orchestration
 *
 * Wires the selection core into a runnable service:
 * - TOML configuration with registered instances and secrets
 * - Structured logging via tracing
 * - Prometheus metrics for selections and lifecycle transitions
 * - Credential lookup for the selected data plane
 * - Async transfer orchestration with retry on another instance
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod runtime;
pub mod secrets;

// Re-export commonly used types
pub use config::{InstanceConfig, LogLevel, SelectorConfig, TransferConfig};
pub use error::{DpfError, Result};
pub use orchestrator::{ExecutionError, TransferContext, TransferExecutor, TransferOrchestrator};
pub use runtime::{MaintenanceReport, SelectorRuntime};
pub use secrets::{EnvSecretStore, SecretStore, StaticSecretStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
