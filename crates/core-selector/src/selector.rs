//! Selector Service: picks the data plane for a transfer and drives its lifecycle
//!
//! `select` is a synchronous, in-memory decision:
//!
//! 1. validate the request
//! 2. ask the registry for live, capable candidates
//! 3. no candidates → `NoEligibleInstance`
//! 4. an explicit hint bypasses the strategy (`HintInstanceUnavailable` if
//!    the hinted instance is not a candidate)
//! 5. otherwise the requested (or default) strategy chooses
//! 6. the outcome is reported to the metrics sink
//!
//! The service also fronts the transfer tracker so that selection, record
//! creation and re-selection after a failure stay consistent with the
//! registry.

use crate::error::{Result, SelectorError};
use crate::metrics::{names, Metric, MetricsSink, NoopMetrics};
use crate::model::{DataPlaneInstance, InstanceId, SelectionKey, TransferId, TransferRequest};
use crate::registry::InstanceRegistry;
use crate::strategy::StrategyRegistry;
use crate::tracker::{FailureOutcome, TransferRecord, TransferState, TransferTracker};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chosen instance (a snapshot; the registry keeps the live entry) or the
/// reason nothing could be chosen
pub type SelectionResult = Result<DataPlaneInstance>;

/// Result of reporting a failed transfer
#[derive(Debug, Clone, PartialEq)]
pub enum FailureResolution {
    /// A new instance was selected; the record is back in `Selected`
    Retrying(TransferRecord),
    /// Retry budget spent; the record is terminally `Failed`
    Exhausted(TransferRecord),
    /// Retry budget left but no instance could be selected; the record is
    /// terminally `Failed`
    ReselectionFailed {
        record: TransferRecord,
        error: SelectorError,
    },
    /// Cancelled while the retry was pending; nothing was re-selected
    Cancelled(TransferRecord),
}

impl FailureResolution {
    pub fn record(&self) -> &TransferRecord {
        match self {
            FailureResolution::Retrying(record)
            | FailureResolution::Exhausted(record)
            | FailureResolution::ReselectionFailed { record, .. }
            | FailureResolution::Cancelled(record) => record,
        }
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self, FailureResolution::Retrying(_))
    }
}

/// Client-facing selection and lifecycle API
pub struct SelectorService {
    registry: Arc<InstanceRegistry>,
    tracker: Arc<TransferTracker>,
    strategies: StrategyRegistry,
    metrics: Arc<dyn MetricsSink>,
}

impl SelectorService {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        tracker: Arc<TransferTracker>,
        strategies: StrategyRegistry,
    ) -> Self {
        Self::with_metrics(registry, tracker, strategies, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        registry: Arc<InstanceRegistry>,
        tracker: Arc<TransferTracker>,
        strategies: StrategyRegistry,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            tracker,
            strategies,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<TransferTracker> {
        &self.tracker
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    /// Choose a data-plane instance for a request
    pub fn select(&self, request: &TransferRequest) -> SelectionResult {
        self.select_excluding(request, &[])
    }

    /// Choose an instance, ignoring the given ones
    pub fn select_excluding(
        &self,
        request: &TransferRequest,
        excluded: &[InstanceId],
    ) -> SelectionResult {
        let result = self.decide(request, excluded);
        if let Ok(chosen) = &result {
            self.registry.record_selection(&chosen.id);
        }
        self.report(request, &result);
        result
    }

    fn decide(&self, request: &TransferRequest, excluded: &[InstanceId]) -> SelectionResult {
        request.validate()?;

        let mut candidates = self.registry.list_candidates(
            &request.source_type,
            &request.destination_type,
            &request.transfer_type,
        );
        candidates.retain(|c| !excluded.contains(&c.id));

        if candidates.is_empty() {
            return Err(SelectorError::no_eligible_instance(request));
        }

        let chosen = match &request.instance_hint {
            Some(hint) => candidates
                .into_iter()
                .find(|c| &c.id == hint)
                .ok_or_else(|| SelectorError::HintInstanceUnavailable(hint.clone()))?,
            None => {
                let strategy = self.strategies.resolve(request)?;
                strategy.select(&candidates, request)?
            }
        };

        Ok(chosen)
    }

    fn report(&self, request: &TransferRequest, result: &SelectionResult) {
        let strategy = if request.instance_hint.is_some() {
            "hint"
        } else {
            request
                .strategy
                .as_deref()
                .unwrap_or(self.strategies.default_name())
        };

        let outcome = match result {
            Ok(instance) => {
                debug!(
                    route = %request.key(),
                    instance_id = %instance.id,
                    strategy,
                    "Data-plane instance selected"
                );
                "selected"
            }
            Err(err) => {
                warn!(route = %request.key(), strategy, error = %err, "Selection failed");
                err.kind()
            }
        };

        self.metrics.emit(
            Metric::counter(names::SELECTION_TOTAL, 1.0)
                .tag("outcome", outcome)
                .tag("strategy", strategy.to_string()),
        );
    }

    /// Select an instance and start tracking the transfer in `Selected`
    pub fn initiate(&self, request: TransferRequest) -> Result<TransferRecord> {
        let instance = self.select(&request)?;
        Ok(self.tracker.create_selected(request, instance.id))
    }

    /// Start tracking a request without selecting yet (`Created`)
    pub fn create_transfer(&self, request: TransferRequest) -> Result<TransferRecord> {
        request.validate()?;
        Ok(self.tracker.create(request))
    }

    /// Created → Selected on an explicitly chosen instance.
    ///
    /// The instance must be a live candidate for the record's request.
    pub fn on_selected(&self, id: &TransferId, instance_id: InstanceId) -> Result<TransferRecord> {
        let record = self.tracker.get(id)?;
        self.ensure_candidate(&record.request, &instance_id)?;
        self.tracker.on_selected(id, instance_id)
    }

    pub fn on_started(&self, id: &TransferId) -> Result<TransferRecord> {
        self.tracker.on_started(id)
    }

    pub fn on_completed(&self, id: &TransferId) -> Result<TransferRecord> {
        self.tracker.on_completed(id)
    }

    /// Report a failed transfer and re-select if the retry budget allows.
    ///
    /// Selection errors during re-selection are not retried; they end the
    /// transfer and are returned in [`FailureResolution::ReselectionFailed`].
    /// A cancel that lands while the retry is pending wins and yields
    /// [`FailureResolution::Cancelled`]; the instance chosen for the retry is
    /// then not charged with a selection.
    pub fn on_failed(&self, id: &TransferId, reason: impl Into<String>) -> Result<FailureResolution> {
        let (record, outcome) = self.tracker.on_failed(id, reason)?;

        let (attempt, excluded) = match outcome {
            FailureOutcome::Exhausted => return Ok(FailureResolution::Exhausted(record)),
            FailureOutcome::RetryRequested { attempt, excluded } => (attempt, excluded),
        };

        let request = &record.request;
        match self.decide(request, &excluded) {
            Ok(instance) => match self.tracker.on_reselected(id, instance.id.clone()) {
                Ok(record) => {
                    self.registry.record_selection(&instance.id);
                    self.report(request, &Ok(instance.clone()));
                    info!(
                        transfer_id = %id,
                        attempt,
                        instance_id = %instance.id,
                        "Re-selected data plane for retry"
                    );
                    Ok(FailureResolution::Retrying(record))
                }
                Err(err) => self.cancelled_or(id, err),
            },
            Err(error) => {
                self.report(request, &Err(error.clone()));
                match self.tracker.abandon_retry(id, error.to_string()) {
                    Ok(record) => Ok(FailureResolution::ReselectionFailed { record, error }),
                    Err(err) => self.cancelled_or(id, err),
                }
            }
        }
    }

    /// Map a rejected retry transition to `Cancelled` when a cancel got there
    /// first; any other error is passed through.
    fn cancelled_or(&self, id: &TransferId, err: SelectorError) -> Result<FailureResolution> {
        match self.tracker.get(id) {
            Ok(record) if record.state == TransferState::Cancelled => {
                info!(transfer_id = %id, "Transfer cancelled during retry, re-selection dropped");
                Ok(FailureResolution::Cancelled(record))
            }
            _ => Err(err),
        }
    }

    pub fn on_cancelled(&self, id: &TransferId) -> Result<TransferRecord> {
        self.tracker.on_cancelled(id)
    }

    pub fn get_record(&self, id: &TransferId) -> Result<TransferRecord> {
        self.tracker.get(id)
    }

    pub fn purge(&self, id: &TransferId) -> Result<TransferRecord> {
        self.tracker.purge(id)
    }

    pub fn purge_expired(&self) -> Vec<TransferId> {
        self.tracker.purge_expired()
    }

    /// Register an instance.
    ///
    /// Ids still referenced by a retained transfer record are refused with
    /// `DuplicateInstance` even after deregistration.
    pub fn register(&self, instance: DataPlaneInstance) -> Result<()> {
        if !self.registry.contains(&instance.id) && self.tracker.references_instance(&instance.id) {
            return Err(SelectorError::DuplicateInstance(instance.id));
        }
        self.registry.register(instance)
    }

    pub fn heartbeat(&self, id: &InstanceId, timestamp: DateTime<Utc>) -> Result<()> {
        self.registry.heartbeat(id, timestamp)
    }

    pub fn deregister(&self, id: &InstanceId) -> bool {
        self.registry.deregister(id)
    }

    pub fn evict_silent(&self, silence: Duration) -> Vec<InstanceId> {
        self.registry.evict_silent(silence)
    }

    /// Drop strategy state kept for routes that currently have no live
    /// candidate. Returns the number of routes dropped.
    pub fn prune_routes(&self) -> usize {
        let pruned = self.strategies.retain_routes(&|key: &SelectionKey| {
            !self
                .registry
                .list_candidates(&key.source_type, &key.destination_type, &key.transfer_type)
                .is_empty()
        });
        if pruned > 0 {
            debug!(pruned, "Pruned idle selection routes");
        }
        pruned
    }

    fn ensure_candidate(&self, request: &TransferRequest, instance_id: &InstanceId) -> Result<()> {
        if !self.registry.contains(instance_id) {
            return Err(SelectorError::UnknownInstance(instance_id.clone()));
        }
        let is_candidate = self
            .registry
            .list_candidates(
                &request.source_type,
                &request.destination_type,
                &request.transfer_type,
            )
            .iter()
            .any(|c| &c.id == instance_id);
        if !is_candidate {
            return Err(SelectorError::HintInstanceUnavailable(instance_id.clone()));
        }
        self.registry.record_selection(instance_id);
        Ok(())
    }
}

impl std::fmt::Debug for SelectorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorService")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .field("strategies", &self.strategies)
            .finish()
    }
}
