//! Transfer State Tracker: lifecycle of every transfer handed to a data plane
//!
//! # Lifecycle States
//!
//! ```text
//!                    ┌─────────────┐
//!      create() ──>  │   Created   │
//!                    └──────┬──────┘
//!                           │ on_selected()
//!                    ┌──────▼──────┐ <─────────────────┐
//!                    │  Selected   │                   │ on_reselected()
//!                    └──────┬──────┘                   │ (retry budget left)
//!                           │ on_started()             │
//!                    ┌──────▼──────┐  on_failed() ┌────┴────┐
//!                    │ InProgress  │ ───────────> │ Failed  │
//!                    └──────┬──────┘              └─────────┘
//!                           │ on_completed()
//!                    ┌──────▼──────┐
//!                    │  Completed  │
//!                    └─────────────┘
//!
//!   on_cancelled(): Selected | InProgress | Failed (retry pending) → Cancelled
//! ```
//!
//! `Completed`, `Cancelled` and `Failed` without a pending retry are
//! terminal. Terminal records are kept for the retention window and then
//! removed by [`TransferTracker::purge_expired`]. Active records can never be
//! purged; they have to be cancelled first.
//!
//! The tracker only does bookkeeping. Re-selection after a failure is driven
//! by the selector service, which owns both the tracker and the registry.

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SelectorError};
use crate::metrics::{names, Metric, MetricsSink, NoopMetrics};
use crate::model::{InstanceId, TransferId, TransferRequest};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Record exists, no instance chosen yet
    Created,
    /// An instance has been chosen
    Selected,
    /// The data plane is moving data
    InProgress,
    /// Data movement finished successfully
    Completed,
    /// Data movement failed
    Failed,
    /// Stopped on request
    Cancelled,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Created => "created",
            TransferState::Selected => "selected",
            TransferState::InProgress => "in_progress",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub transfer_id: TransferId,
    /// `None` for the creation event
    pub from: Option<TransferState>,
    pub to: TransferState,
    /// Instance selected at the time of the transition
    pub instance_id: Option<InstanceId>,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle record of one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub request: TransferRequest,
    /// Currently (or last) selected instance
    pub instance_id: Option<InstanceId>,
    pub state: TransferState,
    /// Number of re-selections after a failure
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Detail of the most recent failure
    pub last_error: Option<String>,
    /// Instances that failed this transfer and are skipped on retry
    pub excluded_instances: Vec<InstanceId>,
    /// Failed, waiting for re-selection
    pub retry_pending: bool,
    pub history: Vec<TransitionEvent>,
}

impl TransferRecord {
    /// Whether the record can no longer change state
    pub fn is_terminal(&self) -> bool {
        match self.state {
            TransferState::Completed | TransferState::Cancelled => true,
            TransferState::Failed => !self.retry_pending,
            _ => false,
        }
    }

    /// Whether the record went through `Selected` at least once
    pub fn was_selected(&self) -> bool {
        self.history
            .iter()
            .any(|e| e.to == TransferState::Selected)
    }
}

/// What happens after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retry budget left: the caller should re-select, skipping `excluded`
    RetryRequested {
        /// Attempt number the retry will run as
        attempt: u32,
        excluded: Vec<InstanceId>,
    },
    /// Retry budget spent; the record is terminally failed
    Exhausted,
}

/// Configuration for lifecycle tracking
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum number of re-selections after failures
    pub retry_limit: u32,

    /// How long terminal records are kept before purging
    pub retention: Duration,

    /// Skip instances that already failed a transfer when re-selecting for it
    pub exclude_failed_on_retry: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retention: Duration::from_secs(3600),
            exclude_failed_on_retry: true,
        }
    }
}

/// Observer of lifecycle transitions
pub trait TransferListener: Send + Sync {
    fn on_transition(&self, record: &TransferRecord, event: &TransitionEvent);
}

/// Tracks the lifecycle of every transfer
pub struct TransferTracker {
    records: Mutex<HashMap<TransferId, TransferRecord>>,
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    listeners: RwLock<Vec<Arc<dyn TransferListener>>>,
}

impl TransferTracker {
    /// Create a tracker using the wall clock and no metrics
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(NoopMetrics))
    }

    pub fn with_parts(
        config: TrackerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
            clock,
            metrics,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to lifecycle transitions
    pub fn add_listener(&self, listener: Arc<dyn TransferListener>) {
        self.listeners.write().push(listener);
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start tracking a request in the `Created` state
    pub fn create(&self, request: TransferRequest) -> TransferRecord {
        let now = self.clock.now();
        let id = TransferId::new();
        let event = TransitionEvent {
            transfer_id: id,
            from: None,
            to: TransferState::Created,
            instance_id: None,
            timestamp: now,
        };
        let record = TransferRecord {
            id,
            request,
            instance_id: None,
            state: TransferState::Created,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            excluded_instances: Vec::new(),
            retry_pending: false,
            history: vec![event.clone()],
        };

        self.records.lock().insert(id, record.clone());
        debug!(transfer_id = %id, "Transfer created");
        self.notify(&record, &event);
        record
    }

    /// Created → Selected
    pub fn on_selected(&self, id: &TransferId, instance_id: InstanceId) -> Result<TransferRecord> {
        self.transition(id, TransferState::Selected, |record| {
            if record.state != TransferState::Created {
                return false;
            }
            record.instance_id = Some(instance_id);
            true
        })
    }

    /// Create a record and move it straight to `Selected`.
    ///
    /// Both transitions happen under one lock acquisition, so no other caller
    /// ever observes the record in `Created`.
    pub fn create_selected(
        &self,
        request: TransferRequest,
        instance_id: InstanceId,
    ) -> TransferRecord {
        let now = self.clock.now();
        let id = TransferId::new();
        let created = TransitionEvent {
            transfer_id: id,
            from: None,
            to: TransferState::Created,
            instance_id: None,
            timestamp: now,
        };
        let selected = TransitionEvent {
            transfer_id: id,
            from: Some(TransferState::Created),
            to: TransferState::Selected,
            instance_id: Some(instance_id.clone()),
            timestamp: now,
        };
        let record = TransferRecord {
            id,
            request,
            instance_id: Some(instance_id.clone()),
            state: TransferState::Selected,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            excluded_instances: Vec::new(),
            retry_pending: false,
            history: vec![created.clone(), selected.clone()],
        };

        self.records.lock().insert(id, record.clone());
        info!(transfer_id = %id, instance_id = %instance_id, "Transfer selected");
        self.notify(&record, &created);
        self.notify(&record, &selected);
        record
    }

    /// Selected → InProgress
    pub fn on_started(&self, id: &TransferId) -> Result<TransferRecord> {
        self.transition(id, TransferState::InProgress, |record| {
            record.state == TransferState::Selected
        })
    }

    /// InProgress → Completed
    pub fn on_completed(&self, id: &TransferId) -> Result<TransferRecord> {
        self.transition(id, TransferState::Completed, |record| {
            record.state == TransferState::InProgress
        })
    }

    /// InProgress → Failed.
    ///
    /// With retry budget left (`attempt_count < retry_limit`) the record is
    /// flagged as waiting for re-selection and the failed instance is added
    /// to the exclusion list (when configured). Otherwise it stays `Failed`
    /// for good.
    pub fn on_failed(
        &self,
        id: &TransferId,
        reason: impl Into<String>,
    ) -> Result<(TransferRecord, FailureOutcome)> {
        let reason = reason.into();
        let retry_limit = self.config.retry_limit;
        let exclude = self.config.exclude_failed_on_retry;

        let record = self.transition(id, TransferState::Failed, |record| {
            if record.state != TransferState::InProgress {
                return false;
            }
            record.last_error = Some(reason);
            if exclude {
                if let Some(failed) = record.instance_id.clone() {
                    if !record.excluded_instances.contains(&failed) {
                        record.excluded_instances.push(failed);
                    }
                }
            }
            record.retry_pending = record.attempt_count < retry_limit;
            true
        })?;

        let outcome = if record.retry_pending {
            FailureOutcome::RetryRequested {
                attempt: record.attempt_count + 1,
                excluded: record.excluded_instances.clone(),
            }
        } else {
            warn!(
                transfer_id = %id,
                attempts = record.attempt_count,
                "Transfer failed permanently, retry budget exhausted"
            );
            self.emit_retry("exhausted");
            FailureOutcome::Exhausted
        };
        Ok((record, outcome))
    }

    /// Failed (retry pending) → Selected on a newly chosen instance
    pub fn on_reselected(
        &self,
        id: &TransferId,
        instance_id: InstanceId,
    ) -> Result<TransferRecord> {
        let record = self.transition(id, TransferState::Selected, |record| {
            if record.state != TransferState::Failed || !record.retry_pending {
                return false;
            }
            record.attempt_count += 1;
            record.retry_pending = false;
            record.instance_id = Some(instance_id);
            true
        })?;
        self.emit_retry("requested");
        Ok(record)
    }

    /// Give up on a pending retry; the record becomes terminally `Failed`.
    ///
    /// Used when re-selection itself fails.
    pub fn abandon_retry(&self, id: &TransferId, reason: impl Into<String>) -> Result<TransferRecord> {
        let reason = reason.into();
        let now = self.clock.now();
        let record = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(id)
                .ok_or(SelectorError::UnknownTransfer(*id))?;
            if record.state != TransferState::Failed || !record.retry_pending {
                return Err(SelectorError::InvalidTransition {
                    transfer_id: *id,
                    from: record.state,
                    to: TransferState::Failed,
                });
            }
            record.retry_pending = false;
            record.last_error = Some(reason);
            record.updated_at = now;
            record.clone()
        };

        warn!(transfer_id = %id, "Retry abandoned, transfer failed permanently");
        self.emit_retry("abandoned");
        Ok(record)
    }

    /// Cancel a transfer.
    ///
    /// Any selected, running or retry-pending record becomes `Cancelled`.
    /// Cancelling a terminal record is a no-op that returns it unchanged.
    /// A record still in `Created` has never been selected and cannot be
    /// cancelled.
    pub fn on_cancelled(&self, id: &TransferId) -> Result<TransferRecord> {
        {
            let records = self.records.lock();
            let record = records
                .get(id)
                .ok_or(SelectorError::UnknownTransfer(*id))?;
            if record.is_terminal() {
                debug!(transfer_id = %id, state = %record.state, "Cancel of terminal transfer ignored");
                return Ok(record.clone());
            }
        }

        self.transition(id, TransferState::Cancelled, |record| {
            if record.is_terminal() || record.state == TransferState::Created {
                return false;
            }
            record.retry_pending = false;
            true
        })
        .or_else(|err| match err {
            // Raced with another transition into a terminal state
            SelectorError::InvalidTransition { .. } => match self.get(id) {
                Ok(record) if record.is_terminal() => Ok(record),
                _ => Err(err),
            },
            other => Err(other),
        })
    }

    /// Snapshot of a record
    pub fn get(&self, id: &TransferId) -> Result<TransferRecord> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or(SelectorError::UnknownTransfer(*id))
    }

    /// Snapshot of every retained record, oldest first
    pub fn list(&self) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Number of non-terminal records
    pub fn active_count(&self) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| !r.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Whether any retained record refers to this instance
    pub fn references_instance(&self, instance_id: &InstanceId) -> bool {
        self.records.lock().values().any(|r| {
            r.instance_id.as_ref() == Some(instance_id)
                || r.excluded_instances.contains(instance_id)
        })
    }

    /// Remove a terminal record now, ignoring the retention window
    pub fn purge(&self, id: &TransferId) -> Result<TransferRecord> {
        let mut records = self.records.lock();
        let record = records
            .get(id)
            .ok_or(SelectorError::UnknownTransfer(*id))?;
        if !record.is_terminal() {
            return Err(SelectorError::RecordStillActive(*id));
        }
        let removed = records.remove(id).ok_or(SelectorError::UnknownTransfer(*id))?;
        debug!(transfer_id = %id, "Transfer record purged");
        Ok(removed)
    }

    /// Remove terminal records whose last transition is older than the
    /// retention window. Returns the purged ids.
    pub fn purge_expired(&self) -> Vec<TransferId> {
        let now = self.clock.now();
        let retention = TimeDelta::from_std(self.config.retention).unwrap_or(TimeDelta::MAX);

        let mut records = self.records.lock();
        let expired: Vec<TransferId> = records
            .values()
            .filter(|r| r.is_terminal() && now.signed_duration_since(r.updated_at) > retention)
            .map(|r| r.id)
            .collect();
        for id in &expired {
            records.remove(id);
        }

        if !expired.is_empty() {
            info!(purged = expired.len(), "Purged expired transfer records");
        }
        expired
    }

    /// Apply a transition to `to` if `apply` accepts the current record.
    ///
    /// `apply` runs under the map lock; returning `false` rejects the
    /// transition with `InvalidTransition` and leaves the record untouched.
    fn transition<F>(&self, id: &TransferId, to: TransferState, apply: F) -> Result<TransferRecord>
    where
        F: FnOnce(&mut TransferRecord) -> bool,
    {
        let now = self.clock.now();
        let (record, event) = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(id)
                .ok_or(SelectorError::UnknownTransfer(*id))?;

            let from = record.state;
            let mut candidate = record.clone();
            if !apply(&mut candidate) {
                return Err(SelectorError::InvalidTransition {
                    transfer_id: *id,
                    from,
                    to,
                });
            }

            let event = TransitionEvent {
                transfer_id: *id,
                from: Some(from),
                to,
                instance_id: candidate.instance_id.clone(),
                timestamp: now,
            };
            candidate.state = to;
            candidate.updated_at = now;
            candidate.history.push(event.clone());
            *record = candidate;
            (record.clone(), event)
        };

        info!(
            transfer_id = %id,
            from = ?event.from,
            to = %to,
            instance_id = record.instance_id.as_ref().map(|i| i.as_str()).unwrap_or("-"),
            "Transfer transition"
        );
        self.notify(&record, &event);
        Ok(record)
    }

    fn notify(&self, record: &TransferRecord, event: &TransitionEvent) {
        self.metrics.emit(
            Metric::counter(names::TRANSFER_TRANSITIONS_TOTAL, 1.0).tag("state", event.to.as_str()),
        );
        for listener in self.listeners.read().iter() {
            listener.on_transition(record, event);
        }
    }

    fn emit_retry(&self, outcome: &str) {
        self.metrics
            .emit(Metric::counter(names::TRANSFER_RETRIES_TOTAL, 1.0).tag("outcome", outcome));
    }
}

impl fmt::Debug for TransferTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTracker")
            .field("records", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::RecordingMetrics;

    fn request() -> TransferRequest {
        TransferRequest::new("HttpData", "AmazonS3", "push")
    }

    fn tracker(retry_limit: u32) -> (TransferTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let tracker = TransferTracker::with_parts(
            TrackerConfig {
                retry_limit,
                retention: Duration::from_secs(60),
                exclude_failed_on_retry: true,
            },
            clock.clone(),
            Arc::new(NoopMetrics),
        );
        (tracker, clock)
    }

    fn running(tracker: &TransferTracker, instance: &str) -> TransferId {
        let record = tracker.create_selected(request(), InstanceId::from(instance));
        tracker.on_started(&record.id).unwrap();
        record.id
    }

    #[test]
    fn test_happy_path() {
        let (tracker, _) = tracker(3);
        let record = tracker.create(request());
        assert_eq!(record.state, TransferState::Created);

        let record = tracker
            .on_selected(&record.id, InstanceId::from("dp-1"))
            .unwrap();
        assert_eq!(record.state, TransferState::Selected);
        assert_eq!(record.instance_id, Some(InstanceId::from("dp-1")));

        let record = tracker.on_started(&record.id).unwrap();
        assert_eq!(record.state, TransferState::InProgress);

        let record = tracker.on_completed(&record.id).unwrap();
        assert_eq!(record.state, TransferState::Completed);
        assert!(record.is_terminal());
        assert!(record.was_selected());

        let states: Vec<TransferState> = record.history.iter().map(|e| e.to).collect();
        assert_eq!(
            states,
            vec![
                TransferState::Created,
                TransferState::Selected,
                TransferState::InProgress,
                TransferState::Completed
            ]
        );
    }

    #[test]
    fn test_created_to_completed_rejected() {
        let (tracker, _) = tracker(3);
        let record = tracker.create(request());

        let err = tracker.on_completed(&record.id).unwrap_err();
        assert_eq!(
            err,
            SelectorError::InvalidTransition {
                transfer_id: record.id,
                from: TransferState::Created,
                to: TransferState::Completed,
            }
        );
        assert_eq!(tracker.get(&record.id).unwrap().state, TransferState::Created);
    }

    #[test]
    fn test_created_cannot_be_cancelled() {
        let (tracker, _) = tracker(3);
        let record = tracker.create(request());
        let err = tracker.on_cancelled(&record.id).unwrap_err();
        assert!(matches!(err, SelectorError::InvalidTransition { .. }));
    }

    #[test]
    fn test_on_selected_only_from_created() {
        let (tracker, _) = tracker(3);
        let id = running(&tracker, "dp-1");
        let err = tracker
            .on_selected(&id, InstanceId::from("dp-2"))
            .unwrap_err();
        assert!(matches!(
            err,
            SelectorError::InvalidTransition {
                from: TransferState::InProgress,
                to: TransferState::Selected,
                ..
            }
        ));
    }

    #[test]
    fn test_start_requires_selected() {
        let (tracker, _) = tracker(3);
        let record = tracker.create(request());
        assert!(tracker.on_started(&record.id).is_err());
    }

    #[test]
    fn test_unknown_transfer() {
        let (tracker, _) = tracker(3);
        let id = TransferId::new();
        assert_eq!(
            tracker.on_started(&id).unwrap_err(),
            SelectorError::UnknownTransfer(id)
        );
        assert_eq!(tracker.get(&id).unwrap_err(), SelectorError::UnknownTransfer(id));
        assert_eq!(tracker.purge(&id).unwrap_err(), SelectorError::UnknownTransfer(id));
    }

    #[test]
    fn test_failure_requests_retry_and_excludes_instance() {
        let (tracker, _) = tracker(2);
        let id = running(&tracker, "dp-1");

        let (record, outcome) = tracker.on_failed(&id, "connection reset").unwrap();
        assert_eq!(record.state, TransferState::Failed);
        assert!(record.retry_pending);
        assert!(!record.is_terminal());
        assert_eq!(record.last_error.as_deref(), Some("connection reset"));
        assert_eq!(
            outcome,
            FailureOutcome::RetryRequested {
                attempt: 1,
                excluded: vec![InstanceId::from("dp-1")],
            }
        );

        let record = tracker
            .on_reselected(&id, InstanceId::from("dp-2"))
            .unwrap();
        assert_eq!(record.state, TransferState::Selected);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.instance_id, Some(InstanceId::from("dp-2")));
    }

    #[test]
    fn test_retry_bound() {
        let retry_limit = 3;
        let (tracker, _) = tracker(retry_limit);
        let id = running(&tracker, "dp-0");

        for attempt in 1..=retry_limit {
            let (_, outcome) = tracker.on_failed(&id, "boom").unwrap();
            assert!(matches!(outcome, FailureOutcome::RetryRequested { .. }));
            tracker
                .on_reselected(&id, InstanceId::from(format!("dp-{}", attempt)))
                .unwrap();
            tracker.on_started(&id).unwrap();
        }

        let (record, outcome) = tracker.on_failed(&id, "boom").unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(record.state, TransferState::Failed);
        assert!(record.is_terminal());
        assert_eq!(record.attempt_count, retry_limit);

        let reentries = record
            .history
            .iter()
            .filter(|e| e.from == Some(TransferState::Failed) && e.to == TransferState::Selected)
            .count();
        assert_eq!(reentries as u32, retry_limit);

        // Terminal: no further re-selection
        assert!(tracker.on_reselected(&id, InstanceId::from("dp-9")).is_err());
    }

    #[test]
    fn test_zero_retry_limit_fails_immediately() {
        let (tracker, _) = tracker(0);
        let id = running(&tracker, "dp-1");
        let (record, outcome) = tracker.on_failed(&id, "boom").unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert!(record.is_terminal());
    }

    #[test]
    fn test_exclusion_disabled() {
        let tracker = TransferTracker::new(TrackerConfig {
            exclude_failed_on_retry: false,
            ..TrackerConfig::default()
        });
        let id = running(&tracker, "dp-1");
        let (_, outcome) = tracker.on_failed(&id, "boom").unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::RetryRequested {
                attempt: 1,
                excluded: vec![],
            }
        );
    }

    #[test]
    fn test_abandon_retry() {
        let (tracker, _) = tracker(3);
        let id = running(&tracker, "dp-1");
        tracker.on_failed(&id, "boom").unwrap();

        let record = tracker.abandon_retry(&id, "no eligible instance").unwrap();
        assert!(record.is_terminal());
        assert_eq!(record.last_error.as_deref(), Some("no eligible instance"));

        // Nothing pending any more
        assert!(tracker.abandon_retry(&id, "again").is_err());
    }

    #[test]
    fn test_cancel_active_and_idempotent_on_terminal() {
        let (tracker, _) = tracker(3);
        let id = running(&tracker, "dp-1");

        let record = tracker.on_cancelled(&id).unwrap();
        assert_eq!(record.state, TransferState::Cancelled);
        let history_len = record.history.len();

        let again = tracker.on_cancelled(&id).unwrap();
        assert_eq!(again.state, TransferState::Cancelled);
        assert_eq!(again.history.len(), history_len);

        let completed = running(&tracker, "dp-1");
        tracker.on_completed(&completed).unwrap();
        let record = tracker.on_cancelled(&completed).unwrap();
        assert_eq!(record.state, TransferState::Completed);
    }

    #[test]
    fn test_cancel_pending_retry_stops_orchestration() {
        let (tracker, _) = tracker(3);
        let id = running(&tracker, "dp-1");
        tracker.on_failed(&id, "boom").unwrap();

        let record = tracker.on_cancelled(&id).unwrap();
        assert_eq!(record.state, TransferState::Cancelled);
        assert!(!record.retry_pending);
        assert!(tracker.on_reselected(&id, InstanceId::from("dp-2")).is_err());
    }

    #[test]
    fn test_purge_requires_terminal() {
        let (tracker, _) = tracker(3);
        let id = running(&tracker, "dp-1");

        assert_eq!(
            tracker.purge(&id).unwrap_err(),
            SelectorError::RecordStillActive(id)
        );

        tracker.on_cancelled(&id).unwrap();
        let purged = tracker.purge(&id).unwrap();
        assert_eq!(purged.state, TransferState::Cancelled);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_purge_expired_respects_retention() {
        let (tracker, clock) = tracker(3);
        let done = running(&tracker, "dp-1");
        tracker.on_completed(&done).unwrap();
        let active = running(&tracker, "dp-2");

        clock.advance(Duration::from_secs(30));
        assert!(tracker.purge_expired().is_empty());

        clock.advance(Duration::from_secs(31));
        assert_eq!(tracker.purge_expired(), vec![done]);
        assert!(tracker.get(&active).is_ok());
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn test_references_instance() {
        let (tracker, _) = tracker(3);
        let id = running(&tracker, "dp-1");
        assert!(tracker.references_instance(&InstanceId::from("dp-1")));
        assert!(!tracker.references_instance(&InstanceId::from("dp-2")));

        tracker.on_cancelled(&id).unwrap();
        tracker.purge(&id).unwrap();
        assert!(!tracker.references_instance(&InstanceId::from("dp-1")));
    }

    #[test]
    fn test_listeners_and_metrics() {
        struct Collect(Mutex<Vec<TransferState>>);

        impl TransferListener for Collect {
            fn on_transition(&self, _record: &TransferRecord, event: &TransitionEvent) {
                self.0.lock().push(event.to);
            }
        }

        let metrics = Arc::new(RecordingMetrics::new());
        let tracker = TransferTracker::with_parts(
            TrackerConfig::default(),
            Arc::new(SystemClock),
            metrics.clone(),
        );
        let listener = Arc::new(Collect(Mutex::new(Vec::new())));
        tracker.add_listener(listener.clone());

        let id = running(&tracker, "dp-1");
        tracker.on_completed(&id).unwrap();

        assert_eq!(
            *listener.0.lock(),
            vec![
                TransferState::Created,
                TransferState::Selected,
                TransferState::InProgress,
                TransferState::Completed
            ]
        );
        assert_eq!(
            metrics.counter_total(names::TRANSFER_TRANSITIONS_TOTAL, None),
            4.0
        );
        assert_eq!(
            metrics.counter_total(
                names::TRANSFER_TRANSITIONS_TOTAL,
                Some(("state", "completed"))
            ),
            1.0
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(TransferState::InProgress.to_string(), "in_progress");
    }
}
