//! Orchestration against a runtime built from configuration
//!
//! Test Scenario:
//! 1. Build a runtime with three data planes, one of them flaky
//! 2. Run a batch of transfers concurrently
//! 3. Verify flaky attempts were retried elsewhere and metrics recorded it

use async_trait::async_trait;
use dpf_core_selector::{InstanceId, TransferRequest, TransferState};
use dpf_selector::config::InstanceConfig;
use dpf_selector::logging::init_test_logging;
use dpf_selector::{
    DpfError, ExecutionError, SelectorConfig, SelectorRuntime, TransferContext,
    TransferExecutor, TransferOrchestrator,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Always fails on one instance, succeeds everywhere else
struct FlakyInstance {
    flaky: InstanceId,
    attempts: AtomicUsize,
}

#[async_trait]
impl TransferExecutor for FlakyInstance {
    async fn execute(&self, context: &TransferContext) -> Result<(), ExecutionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if context.instance.id == self.flaky {
            Err(ExecutionError::Retryable(format!(
                "{} refused connection",
                context.instance.id
            )))
        } else {
            Ok(())
        }
    }
}

fn instance(id: &str) -> InstanceConfig {
    InstanceConfig {
        id: id.to_string(),
        source_types: vec!["HttpData".to_string()],
        destination_types: vec!["AmazonS3".to_string()],
        transfer_types: vec!["push".to_string()],
        properties: BTreeMap::new(),
        url: None,
    }
}

fn runtime(default_strategy: &str) -> SelectorRuntime {
    let config = SelectorConfig {
        default_strategy: default_strategy.to_string(),
        random_seed: Some(5),
        retry_limit: 2,
        instances: vec![instance("dp-1"), instance("dp-2"), instance("dp-3")],
        ..Default::default()
    };
    SelectorRuntime::build(config).unwrap()
}

#[tokio::test]
async fn test_batch_survives_flaky_instance() {
    init_test_logging();

    let runtime = runtime("round-robin");
    let executor = Arc::new(FlakyInstance {
        flaky: InstanceId::from("dp-2"),
        attempts: AtomicUsize::new(0),
    });
    let orchestrator = Arc::new(TransferOrchestrator::new(
        runtime.service().clone(),
        runtime.secrets().clone(),
        executor.clone(),
    ));

    let requests = vec![TransferRequest::new("HttpData", "AmazonS3", "push"); 9];
    let results = orchestrator.run_all(requests).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let mut retried = 0;
    for record in results.into_iter().flatten() {
        assert_eq!(record.state, TransferState::Completed);
        assert_ne!(record.instance_id, Some(InstanceId::from("dp-2")));
        if record.attempt_count > 0 {
            assert_eq!(record.attempt_count, 1);
            assert_eq!(record.excluded_instances, vec![InstanceId::from("dp-2")]);
            retried += 1;
        }
    }

    // Round robin hands dp-2 at least the second transfer; each of those
    // is retried exactly once on a healthy instance
    assert!(retried >= 1);
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 9 + retried);

    let metrics = runtime.render_metrics().unwrap();
    assert!(metrics.contains(&format!(
        "dpf_transfer_retries_total{{outcome=\"requested\"}} {}",
        retried
    )));
    assert!(metrics.contains("dpf_transfer_transitions_total{state=\"completed\"} 9"));
}

#[tokio::test]
async fn test_transfer_pinned_to_flaky_instance_fails() {
    init_test_logging();

    let runtime = runtime("random");
    let executor = Arc::new(FlakyInstance {
        flaky: InstanceId::from("dp-1"),
        attempts: AtomicUsize::new(0),
    });
    let orchestrator = TransferOrchestrator::new(
        runtime.service().clone(),
        runtime.secrets().clone(),
        executor.clone(),
    );

    // The hint stays on the request, so every re-selection needs dp-1,
    // which was excluded after its first failure.
    let err = orchestrator
        .run(TransferRequest::new("HttpData", "AmazonS3", "push").with_hint("dp-1"))
        .await
        .unwrap_err();

    match err {
        DpfError::TransferFailed { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);

    let record = runtime.service().tracker().list().pop().unwrap();
    assert_eq!(record.state, TransferState::Failed);
    assert!(record
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("not available"));
}

#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let runtime = runtime("random");
    let executor = Arc::new(FlakyInstance {
        flaky: InstanceId::from("none"),
        attempts: AtomicUsize::new(0),
    });
    let orchestrator = TransferOrchestrator::new(
        runtime.service().clone(),
        runtime.secrets().clone(),
        executor,
    );

    let record = orchestrator
        .run(TransferRequest::new("HttpData", "AmazonS3", "push"))
        .await
        .unwrap();
    let after = orchestrator.cancel(&record.id).unwrap();
    assert_eq!(after.state, TransferState::Completed);
}
