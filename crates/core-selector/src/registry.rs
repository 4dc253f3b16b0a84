//! Instance Registry: known data-plane instances and their capabilities
//!
//! The registry is an owned object, constructed when the selector runtime
//! starts and shared through an `Arc`. All mutation goes through a single
//! read/write lock over the instance map, so each operation is atomic with
//! respect to every other.
//!
//! Liveness is never stored. It is recomputed on every read from the last
//! heartbeat and the configured liveness window, so there is no background
//! timer to coordinate with.
//!
//! # Example
//!
//! ```
//! use dpf_core_selector::registry::{InstanceRegistry, RegistryConfig};
//! use dpf_core_selector::model::{DataPlaneInstance, TypeTag};
//!
//! let registry = InstanceRegistry::new(RegistryConfig::default());
//! registry
//!     .register(
//!         DataPlaneInstance::new("dp-1")
//!             .with_source_type("HttpData")
//!             .with_destination_type("AmazonS3")
//!             .with_transfer_type("push"),
//!     )
//!     .unwrap();
//!
//! let candidates = registry.list_candidates(
//!     &TypeTag::from("HttpData"),
//!     &TypeTag::from("AmazonS3"),
//!     &TypeTag::from("push"),
//! );
//! assert_eq!(candidates.len(), 1);
//! ```

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SelectorError};
use crate::metrics::{names, Metric, MetricsSink, NoopMetrics};
use crate::model::{DataPlaneInstance, InstanceId, TypeTag};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the instance registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum heartbeat age before an instance stops being a candidate
    pub liveness_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(30),
        }
    }
}

/// Registry of data-plane instances
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, DataPlaneInstance>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl InstanceRegistry {
    /// Create an empty registry using the wall clock and no metrics
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(NoopMetrics))
    }

    /// Create an empty registry with an explicit clock and metrics sink
    pub fn with_parts(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            config,
            clock,
            metrics,
        }
    }

    /// Register a new instance and mark it live.
    ///
    /// The heartbeat is stamped with the current time and selection counters
    /// start from zero.
    ///
    /// # Errors
    ///
    /// `DuplicateInstance` if an instance with the same id is already present.
    pub fn register(&self, mut instance: DataPlaneInstance) -> Result<()> {
        let count = {
            let mut instances = self.instances.write();
            if instances.contains_key(&instance.id) {
                return Err(SelectorError::DuplicateInstance(instance.id));
            }

            instance.last_heartbeat = self.clock.now();
            instance.turn_count = 0;
            instance.last_selected = None;

            info!(
                instance_id = %instance.id,
                url = instance.url.as_deref().unwrap_or("-"),
                "Registering data-plane instance"
            );
            instances.insert(instance.id.clone(), instance);
            instances.len()
        };

        self.emit_count(count);
        Ok(())
    }

    /// Record a heartbeat for an instance.
    ///
    /// Heartbeats that arrive out of order never move the stored timestamp
    /// backwards. Timestamps ahead of the registry clock are stored as the
    /// current time.
    ///
    /// # Errors
    ///
    /// `UnknownInstance` if the id is not registered.
    pub fn heartbeat(&self, id: &InstanceId, timestamp: DateTime<Utc>) -> Result<()> {
        let now = self.clock.now();
        let timestamp = if timestamp > now {
            debug!(instance_id = %id, %timestamp, "Heartbeat ahead of clock, clamping");
            now
        } else {
            timestamp
        };

        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| SelectorError::UnknownInstance(id.clone()))?;

        if timestamp > instance.last_heartbeat {
            instance.last_heartbeat = timestamp;
        } else {
            debug!(instance_id = %id, "Ignoring stale heartbeat");
        }
        Ok(())
    }

    /// Remove an instance. Removing an unknown id is not an error.
    ///
    /// Returns `true` if an instance was removed.
    pub fn deregister(&self, id: &InstanceId) -> bool {
        let (removed, count) = {
            let mut instances = self.instances.write();
            let removed = instances.remove(id).is_some();
            (removed, instances.len())
        };

        if removed {
            info!(instance_id = %id, "Deregistered data-plane instance");
            self.emit_count(count);
        } else {
            debug!(instance_id = %id, "Deregister of unknown instance ignored");
        }
        removed
    }

    /// Live instances supporting all three requested types, ordered by id
    pub fn list_candidates(
        &self,
        source_type: &TypeTag,
        destination_type: &TypeTag,
        transfer_type: &TypeTag,
    ) -> Vec<DataPlaneInstance> {
        let now = self.clock.now();
        let window = self.config.liveness_window;

        let mut candidates: Vec<DataPlaneInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| i.is_live(now, window))
            .filter(|i| i.can_handle(source_type, destination_type, transfer_type))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Snapshot of a single instance
    pub fn get(&self, id: &InstanceId) -> Option<DataPlaneInstance> {
        self.instances.read().get(id).cloned()
    }

    /// Snapshot of every registered instance, live or not, ordered by id
    pub fn list_all(&self) -> Vec<DataPlaneInstance> {
        let mut all: Vec<DataPlaneInstance> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Whether the instance is registered and currently live
    pub fn is_live(&self, id: &InstanceId) -> bool {
        let now = self.clock.now();
        self.instances
            .read()
            .get(id)
            .is_some_and(|i| i.is_live(now, self.config.liveness_window))
    }

    /// Whether an instance with this id is registered
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Remove instances whose last heartbeat is older than `silence`.
    ///
    /// Returns the ids that were evicted. This is explicit bookkeeping to be
    /// called by the owner of the registry; nothing runs it in the background.
    pub fn evict_silent(&self, silence: Duration) -> Vec<InstanceId> {
        let now = self.clock.now();
        let (evicted, count) = {
            let mut instances = self.instances.write();
            let mut evicted: Vec<InstanceId> = instances
                .values()
                .filter(|i| !i.is_live(now, silence))
                .map(|i| i.id.clone())
                .collect();
            evicted.sort();
            for id in &evicted {
                instances.remove(id);
            }
            (evicted, instances.len())
        };

        if !evicted.is_empty() {
            warn!(
                evicted = evicted.len(),
                "Evicted silent data-plane instances"
            );
            self.emit_count(count);
        }
        evicted
    }

    /// Bump the selection counters of an instance.
    ///
    /// Returns `false` if the instance disappeared since it was selected.
    pub fn record_selection(&self, id: &InstanceId) -> bool {
        let now = self.clock.now();
        match self.instances.write().get_mut(id) {
            Some(instance) => {
                instance.turn_count += 1;
                instance.last_selected = Some(now);
                true
            }
            None => false,
        }
    }

    /// Configured liveness window
    pub fn liveness_window(&self) -> Duration {
        self.config.liveness_window
    }

    /// Current time as seen by this registry
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn emit_count(&self, count: usize) {
        self.metrics
            .emit(Metric::gauge(names::REGISTERED_INSTANCES, count as f64));
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.len())
            .field("config", &self.config)
            .finish()
    }
}
