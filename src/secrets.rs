/*!
 * Credential lookup for data-plane instances
 *
 * An instance names the secret it needs through its `auth_key` property;
 * the orchestrator resolves that key through a [`SecretStore`] before
 * handing the transfer to an executor.
 */

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::SecretConfig;

/// Read-only secret lookup
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Resolve a secret by key; `None` if the store has no such key
    fn get_secret(&self, key: &str) -> Option<SecretString>;
}

fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::new(secret.expose_secret().into())
}

/// In-memory secrets, typically loaded from the `[[secrets]]` config table
#[derive(Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, SecretString>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[SecretConfig]) -> Self {
        let mut store = Self::new();
        for entry in entries {
            store.insert(entry.key.clone(), entry.value.clone());
        }
        store
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value: String = value.into();
        self.secrets
            .insert(key.into(), SecretString::new(value.into_boxed_str()));
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl SecretStore for StaticSecretStore {
    fn get_secret(&self, key: &str) -> Option<SecretString> {
        self.secrets.get(key).map(copy_secret)
    }
}

impl fmt::Debug for StaticSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.secrets.keys().collect();
        keys.sort();
        f.debug_struct("StaticSecretStore")
            .field("keys", &keys)
            .finish()
    }
}

/// Secrets from environment variables.
///
/// Key `dp-1.token` is looked up as `DPF_SECRET_DP_1_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub const DEFAULT_PREFIX: &'static str = "DPF_SECRET_";

    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for a secret key
    pub fn variable_name(&self, key: &str) -> String {
        let normalized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for EnvSecretStore {
    fn get_secret(&self, key: &str) -> Option<SecretString> {
        std::env::var(self.variable_name(key))
            .ok()
            .filter(|value| !value.is_empty())
            .map(|value| SecretString::new(value.into_boxed_str()))
    }
}

/// Tries each store in order and returns the first hit
#[derive(Debug, Default, Clone)]
pub struct ChainedSecretStore {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl ChainedSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.stores.push(store);
        self
    }
}

impl SecretStore for ChainedSecretStore {
    fn get_secret(&self, key: &str) -> Option<SecretString> {
        self.stores.iter().find_map(|store| store.get_secret(key))
    }
}
