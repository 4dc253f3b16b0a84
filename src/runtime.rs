/*!
 * Runtime bootstrap
 *
 * Builds the registry, tracker, strategies, metrics and secret store from a
 * [`SelectorConfig`] and owns them for the life of the process. Nothing here
 * is global: two runtimes in one process are fully independent.
 */

use dpf_core_selector::clock::{Clock, SystemClock};
use dpf_core_selector::registry::InstanceRegistry;
use dpf_core_selector::strategy::StrategyRegistry;
use dpf_core_selector::tracker::TransferTracker;
use dpf_core_selector::{InstanceId, SelectorService, TransferId};
use dpf_observability::PrometheusMetrics;
use std::sync::Arc;
use tracing::info;

use crate::config::SelectorConfig;
use crate::error::Result;
use crate::secrets::{ChainedSecretStore, EnvSecretStore, SecretStore, StaticSecretStore};

/// What one maintenance pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: Vec<InstanceId>,
    pub purged: Vec<TransferId>,
    /// Routes whose strategy state was dropped for lack of live candidates
    pub pruned_routes: usize,
}

/// Lifecycle-scoped owner of the selector components
#[derive(Debug)]
pub struct SelectorRuntime {
    config: SelectorConfig,
    service: Arc<SelectorService>,
    metrics: Arc<PrometheusMetrics>,
    secrets: Arc<dyn SecretStore>,
}

impl SelectorRuntime {
    /// Build a runtime on the system clock
    pub fn build(config: SelectorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a runtime on the given clock
    pub fn with_clock(config: SelectorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(PrometheusMetrics::new()?);
        let registry = Arc::new(InstanceRegistry::with_parts(
            config.registry_config(),
            clock.clone(),
            metrics.clone(),
        ));
        let tracker = Arc::new(TransferTracker::with_parts(
            config.tracker_config(),
            clock,
            metrics.clone(),
        ));
        let strategies = StrategyRegistry::with_builtin(&config.default_strategy, config.random_seed)?;
        let service = Arc::new(SelectorService::with_metrics(
            registry,
            tracker,
            strategies,
            metrics.clone(),
        ));

        for instance in &config.instances {
            service.register(instance.to_instance())?;
        }

        let secrets: Arc<dyn SecretStore> = Arc::new(
            ChainedSecretStore::new()
                .with_store(Arc::new(StaticSecretStore::from_config(&config.secrets)))
                .with_store(Arc::new(EnvSecretStore::new())),
        );

        info!(
            instances = config.instances.len(),
            strategy = %config.default_strategy,
            liveness_window_secs = config.liveness_window_secs,
            retry_limit = config.retry_limit,
            "Selector runtime ready"
        );

        Ok(Self {
            config,
            service,
            metrics,
            secrets,
        })
    }

    /// Replace the secret store
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<SelectorService> {
        &self.service
    }

    pub fn metrics(&self) -> &Arc<PrometheusMetrics> {
        &self.metrics
    }

    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// Evict silent instances, purge expired transfer records and drop
    /// strategy state for routes nothing can serve
    pub fn maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            evicted: self.service.evict_silent(self.config.eviction_window()),
            purged: self.service.purge_expired(),
            pruned_routes: self.service.prune_routes(),
        };
        if !report.evicted.is_empty() || !report.purged.is_empty() || report.pruned_routes > 0 {
            info!(
                evicted = report.evicted.len(),
                purged = report.purged.len(),
                pruned_routes = report.pruned_routes,
                "Maintenance pass"
            );
        }
        report
    }

    /// Metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        Ok(self.metrics.render()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use dpf_core_selector::clock::ManualClock;
    use dpf_core_selector::TransferRequest;
    use std::time::Duration;

    fn config() -> SelectorConfig {
        SelectorConfig {
            liveness_window_secs: 10,
            eviction_window_secs: 60,
            retention_secs: 30,
            default_strategy: "round-robin".to_string(),
            instances: vec![InstanceConfig {
                id: "dp-1".to_string(),
                source_types: vec!["HttpData".to_string()],
                destination_types: vec!["AmazonS3".to_string()],
                transfer_types: vec!["push".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_registers_configured_instances() {
        let runtime = SelectorRuntime::build(config()).unwrap();
        assert_eq!(runtime.service().registry().len(), 1);
        assert!(runtime
            .render_metrics()
            .unwrap()
            .contains("dpf_registered_instances 1"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let bad = SelectorConfig {
            default_strategy: "cheapest".to_string(),
            ..config()
        };
        assert!(SelectorRuntime::build(bad).is_err());
    }

    #[test]
    fn test_maintenance_evicts_and_purges() {
        let clock = Arc::new(ManualClock::default());
        let runtime = SelectorRuntime::with_clock(config(), clock.clone()).unwrap();
        let service = runtime.service();

        let record = service
            .initiate(TransferRequest::new("HttpData", "AmazonS3", "push"))
            .unwrap();
        service.on_started(&record.id).unwrap();
        service.on_completed(&record.id).unwrap();

        clock.advance(Duration::from_secs(31));
        let report = runtime.maintenance();
        assert!(report.evicted.is_empty());
        assert_eq!(report.purged, vec![record.id]);
        // dp-1 is silent, so the round-robin cursor for its route goes
        assert_eq!(report.pruned_routes, 1);

        clock.advance(Duration::from_secs(30));
        let report = runtime.maintenance();
        assert_eq!(report.evicted, vec![InstanceId::from("dp-1")]);
        assert_eq!(report.pruned_routes, 0);
        assert!(service.registry().is_empty());
    }

    #[test]
    fn test_runtimes_are_independent() {
        let a = SelectorRuntime::build(config()).unwrap();
        let b = SelectorRuntime::build(SelectorConfig::default()).unwrap();
        assert_eq!(a.service().registry().len(), 1);
        assert!(b.service().registry().is_empty());
    }
}
