/*!
 * Configuration types for the selector runtime
 */

use dpf_core_selector::registry::RegistryConfig;
use dpf_core_selector::strategy::{RANDOM, ROUND_ROBIN};
use dpf_core_selector::tracker::TrackerConfig;
use dpf_core_selector::{DataPlaneInstance, TransferRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DpfError, Result};

/// Top-level configuration, usually loaded from `dpf-selector.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Seconds since the last heartbeat during which an instance is live
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,

    /// Seconds of silence after which `evict_silent` drops an instance
    #[serde(default = "default_eviction_window")]
    pub eviction_window_secs: u64,

    /// Re-selections allowed after failures, per transfer
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Seconds a terminal transfer record is kept before purge
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Skip instances that already failed a transfer when retrying it
    #[serde(default = "default_true")]
    pub exclude_failed_on_retry: bool,

    /// Strategy used when a request names none
    #[serde(default = "default_strategy")]
    pub default_strategy: String,

    /// Seed for the random strategy (None = seeded from the OS)
    #[serde(default)]
    pub random_seed: Option<u64>,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,

    /// Data planes registered at startup
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Static secrets resolvable by `auth_key`
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,

    /// Transfers run by the `simulate` command
    #[serde(default)]
    pub transfers: Vec<TransferConfig>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: default_liveness_window(),
            eviction_window_secs: default_eviction_window(),
            retry_limit: default_retry_limit(),
            retention_secs: default_retention(),
            exclude_failed_on_retry: true,
            default_strategy: default_strategy(),
            random_seed: None,
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
            instances: Vec::new(),
            secrets: Vec::new(),
            transfers: Vec::new(),
        }
    }
}

/// A data-plane instance as declared in configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub source_types: Vec<String>,

    #[serde(default)]
    pub destination_types: Vec<String>,

    #[serde(default)]
    pub transfer_types: Vec<String>,

    /// Free-form properties (`auth_key`, `capacity`, `allowed_destinations`, ...)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn to_instance(&self) -> DataPlaneInstance {
        let mut instance = DataPlaneInstance::new(self.id.as_str());
        if let Some(url) = &self.url {
            instance = instance.with_url(url.as_str());
        }
        for tag in &self.source_types {
            instance = instance.with_source_type(tag.as_str());
        }
        for tag in &self.destination_types {
            instance = instance.with_destination_type(tag.as_str());
        }
        for tag in &self.transfer_types {
            instance = instance.with_transfer_type(tag.as_str());
        }
        for (key, value) in &self.properties {
            instance = instance.with_property(key.as_str(), value.as_str());
        }
        instance
    }
}

/// A static secret entry
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SecretConfig {
    pub key: String,
    pub value: String,
}

impl fmt::Debug for SecretConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretConfig")
            .field("key", &self.key)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// A transfer request as declared in configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    pub source_type: String,
    pub destination_type: String,
    pub transfer_type: String,

    #[serde(default)]
    pub instance_hint: Option<String>,

    #[serde(default)]
    pub strategy: Option<String>,
}

impl TransferConfig {
    pub fn to_request(&self) -> TransferRequest {
        let mut request = TransferRequest::new(
            self.source_type.as_str(),
            self.destination_type.as_str(),
            self.transfer_type.as_str(),
        );
        if let Some(hint) = &self.instance_hint {
            request = request.with_hint(hint.as_str());
        }
        if let Some(strategy) = &self.strategy {
            request = request.with_strategy(strategy.as_str());
        }
        request
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
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

fn default_true() -> bool {
    true
}

fn default_liveness_window() -> u64 {
    30
}

fn default_eviction_window() -> u64 {
    300
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retention() -> u64 {
    3600
}

fn default_strategy() -> String {
    RANDOM.to_string()
}

impl SelectorConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SelectorConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| DpfError::Config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.liveness_window_secs == 0 {
            return Err(DpfError::Config(
                "liveness_window_secs must be greater than 0".to_string(),
            ));
        }
        if self.eviction_window_secs < self.liveness_window_secs {
            return Err(DpfError::Config(format!(
                "eviction_window_secs ({}) must not be shorter than liveness_window_secs ({})",
                self.eviction_window_secs, self.liveness_window_secs
            )));
        }
        if self.default_strategy != RANDOM && self.default_strategy != ROUND_ROBIN {
            return Err(DpfError::Config(format!(
                "Unknown default_strategy '{}' (expected '{}' or '{}')",
                self.default_strategy, RANDOM, ROUND_ROBIN
            )));
        }

        let mut seen = HashSet::new();
        for instance in &self.instances {
            if instance.id.trim().is_empty() {
                return Err(DpfError::Config("Instance with empty id".to_string()));
            }
            if !seen.insert(instance.id.as_str()) {
                return Err(DpfError::Config(format!(
                    "Duplicate instance id '{}'",
                    instance.id
                )));
            }
        }

        let mut keys = HashSet::new();
        for secret in &self.secrets {
            if !keys.insert(secret.key.as_str()) {
                return Err(DpfError::Config(format!(
                    "Duplicate secret key '{}'",
                    secret.key
                )));
            }
        }

        for (index, transfer) in self.transfers.iter().enumerate() {
            transfer.to_request().validate().map_err(|e| {
                DpfError::Config(format!("transfers[{}]: {}", index, e))
            })?;
        }

        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            liveness_window: Duration::from_secs(self.liveness_window_secs),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            retry_limit: self.retry_limit,
            retention: Duration::from_secs(self.retention_secs),
            exclude_failed_on_retry: self.exclude_failed_on_retry,
        }
    }

    pub fn eviction_window(&self) -> Duration {
        Duration::from_secs(self.eviction_window_secs)
    }
}
