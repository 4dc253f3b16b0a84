/*!
 * Transfer orchestration
 *
 * Drives a transfer through the selector lifecycle against a pluggable
 * [`TransferExecutor`]: select, start, resolve credentials, execute, then
 * complete or fail. A failure with retry budget left loops on the instance
 * the selector re-selected. Cancellation is cooperative: the loop notices a
 * cancelled record at the next lifecycle step and stops; an execution
 * already in flight is not interrupted.
 */

use async_trait::async_trait;
use dpf_core_selector::model::PROPERTY_AUTH_KEY;
use dpf_core_selector::tracker::FailureOutcome;
use dpf_core_selector::{
    DataPlaneInstance, FailureResolution, SelectorError, SelectorService, TransferId,
    TransferRecord, TransferRequest, TransferState,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{DpfError, Result};
use crate::secrets::SecretStore;

/// Everything an executor needs for one attempt
#[derive(Debug)]
pub struct TransferContext {
    pub transfer_id: TransferId,
    /// 0 for the first attempt, incremented on every re-selection
    pub attempt: u32,
    pub request: TransferRequest,
    pub instance: DataPlaneInstance,
    /// Secret named by the instance's `auth_key` property, if any
    pub credential: Option<SecretString>,
}

/// Why an attempt did not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The attempt failed; another instance may succeed
    #[error("{0}")]
    Retryable(String),

    /// The transfer cannot succeed anywhere; no re-selection
    #[error("{0}")]
    Fatal(String),
}

/// Protocol-specific data movement on a selected data plane
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(&self, context: &TransferContext) -> std::result::Result<(), ExecutionError>;
}

/// Runs transfers end to end
pub struct TransferOrchestrator {
    service: Arc<SelectorService>,
    secrets: Arc<dyn SecretStore>,
    executor: Arc<dyn TransferExecutor>,
}

impl TransferOrchestrator {
    pub fn new(
        service: Arc<SelectorService>,
        secrets: Arc<dyn SecretStore>,
        executor: Arc<dyn TransferExecutor>,
    ) -> Self {
        Self {
            service,
            secrets,
            executor,
        }
    }

    /// Select an instance and run the transfer to a terminal state.
    ///
    /// Returns the completed record, or `TransferFailed` /
    /// `TransferCancelled` describing how it ended.
    pub async fn run(&self, request: TransferRequest) -> Result<TransferRecord> {
        let record = self.service.initiate(request)?;
        info!(
            transfer_id = %record.id,
            route = %record.request.key(),
            "Transfer initiated"
        );
        self.drive(&record.id).await
    }

    /// Run several transfers concurrently; results are in request order
    pub async fn run_all(
        self: &Arc<Self>,
        requests: Vec<TransferRequest>,
    ) -> Vec<Result<TransferRecord>> {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move { orchestrator.run(request).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|e| {
                Err(DpfError::Config(format!("Transfer task panicked: {}", e)))
            }));
        }
        results
    }

    /// Cancel a transfer; a running attempt finishes but is not retried
    pub fn cancel(&self, id: &TransferId) -> Result<TransferRecord> {
        let record = self.service.on_cancelled(id)?;
        info!(transfer_id = %id, "Transfer cancelled");
        Ok(record)
    }

    /// Drive a `Selected` record until it is terminal
    pub async fn drive(&self, id: &TransferId) -> Result<TransferRecord> {
        loop {
            let record = self
                .service
                .on_started(id)
                .map_err(|e| self.interrupted(id, e))?;
            let attempt = record.attempt_count;

            let outcome = match self.prepare(record) {
                Ok(context) => {
                    debug!(
                        transfer_id = %id,
                        attempt,
                        instance_id = %context.instance.id,
                        "Executing transfer"
                    );
                    self.executor.execute(&context).await
                }
                Err(reason) => Err(reason),
            };

            match outcome {
                Ok(()) => {
                    let record = self
                        .service
                        .on_completed(id)
                        .map_err(|e| self.interrupted(id, e))?;
                    info!(transfer_id = %id, attempt, "Transfer completed");
                    return Ok(record);
                }
                Err(ExecutionError::Retryable(reason)) => {
                    warn!(transfer_id = %id, attempt, reason = %reason, "Transfer attempt failed");
                    let resolution = self
                        .service
                        .on_failed(id, reason)
                        .map_err(|e| self.interrupted(id, e))?;
                    match resolution {
                        FailureResolution::Retrying(_) => continue,
                        FailureResolution::Exhausted(record) => return Err(failed(&record)),
                        FailureResolution::ReselectionFailed { record, .. } => {
                            return Err(failed(&record))
                        }
                        FailureResolution::Cancelled(_) => {
                            return Err(DpfError::TransferCancelled(id.to_string()))
                        }
                    }
                }
                Err(ExecutionError::Fatal(reason)) => {
                    warn!(transfer_id = %id, attempt, reason = %reason, "Transfer failed fatally");
                    let record = self.fail_permanently(id, reason)?;
                    return Err(failed(&record));
                }
            }
        }
    }

    fn prepare(&self, record: TransferRecord) -> std::result::Result<TransferContext, ExecutionError> {
        let instance_id = record
            .instance_id
            .ok_or_else(|| ExecutionError::Fatal("no instance selected".to_string()))?;
        let instance = self
            .service
            .registry()
            .get(&instance_id)
            .ok_or_else(|| {
                ExecutionError::Retryable(format!("instance {} was deregistered", instance_id))
            })?;

        let credential = match instance.property(PROPERTY_AUTH_KEY) {
            Some(key) => Some(self.secrets.get_secret(key).ok_or_else(|| {
                ExecutionError::Retryable(format!("secret '{}' not found", key))
            })?),
            None => None,
        };

        Ok(TransferContext {
            transfer_id: record.id,
            attempt: record.attempt_count,
            request: record.request,
            instance,
            credential,
        })
    }

    /// Fail without re-selection even if retry budget is left
    fn fail_permanently(&self, id: &TransferId, reason: String) -> Result<TransferRecord> {
        let tracker = self.service.tracker();
        let (record, outcome) = tracker
            .on_failed(id, reason.clone())
            .map_err(|e| self.interrupted(id, e))?;
        match outcome {
            FailureOutcome::Exhausted => Ok(record),
            FailureOutcome::RetryRequested { .. } => Ok(tracker.abandon_retry(id, reason)?),
        }
    }

    /// Map a rejected transition to `TransferCancelled` if the record was
    /// cancelled underneath us
    fn interrupted(&self, id: &TransferId, err: SelectorError) -> DpfError {
        match self.service.get_record(id) {
            Ok(record) if record.state == TransferState::Cancelled => {
                DpfError::TransferCancelled(id.to_string())
            }
            _ => err.into(),
        }
    }
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("service", &self.service)
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

fn failed(record: &TransferRecord) -> DpfError {
    DpfError::TransferFailed {
        transfer_id: record.id.to_string(),
        attempts: record.attempt_count + 1,
        reason: record
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

/// Executor that sleeps and fails at random; used by `dpf-selector simulate`
#[derive(Debug)]
pub struct SimulatedExecutor {
    failure_rate: f64,
    latency: Duration,
    rng: Mutex<StdRng>,
}

impl SimulatedExecutor {
    /// `failure_rate` must be a probability in `[0.0, 1.0]`
    pub fn new(failure_rate: f64, latency: Duration, seed: Option<u64>) -> Result<Self> {
        if !(0.0..=1.0).contains(&failure_rate) {
            return Err(DpfError::Config(format!(
                "failure rate must be between 0.0 and 1.0, got {}",
                failure_rate
            )));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            failure_rate,
            latency,
            rng: Mutex::new(rng),
        })
    }
}

#[async_trait]
impl TransferExecutor for SimulatedExecutor {
    async fn execute(&self, context: &TransferContext) -> std::result::Result<(), ExecutionError> {
        let (fails, jitter) = {
            let mut rng = self.rng.lock();
            (
                rng.random_bool(self.failure_rate),
                rng.random_range(0.5..1.5),
            )
        };

        tokio::time::sleep(self.latency.mul_f64(jitter)).await;

        if fails {
            Err(ExecutionError::Retryable(format!(
                "simulated failure on {}",
                context.instance.id
            )))
        } else {
            Ok(())
        }
    }
}
