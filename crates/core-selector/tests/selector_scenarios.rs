//! Selector end-to-end scenarios
//!
//! Drives the public API the way a control plane would:
//! 1. Register data planes and fan requests out across them
//! 2. Lose instances (deregistration, silence) and check what is still chosen
//! 3. Walk transfers through failure, re-selection and cancellation
//! 4. Hammer the service from several threads at once

use dpf_core_selector::metrics::{names, RecordingMetrics};
use dpf_core_selector::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

struct Harness {
    service: Arc<SelectorService>,
    clock: Arc<ManualClock>,
    metrics: Arc<RecordingMetrics>,
}

fn harness(default_strategy: &str, seed: Option<u64>, retry_limit: u32) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let metrics = Arc::new(RecordingMetrics::new());
    let registry = Arc::new(InstanceRegistry::with_parts(
        RegistryConfig {
            liveness_window: Duration::from_secs(10),
        },
        clock.clone(),
        metrics.clone(),
    ));
    let tracker = Arc::new(TransferTracker::with_parts(
        TrackerConfig {
            retry_limit,
            retention: Duration::from_secs(60),
            exclude_failed_on_retry: true,
        },
        clock.clone(),
        metrics.clone(),
    ));
    let strategies = StrategyRegistry::with_builtin(default_strategy, seed).unwrap();

    Harness {
        service: Arc::new(SelectorService::with_metrics(
            registry,
            tracker,
            strategies,
            metrics.clone(),
        )),
        clock,
        metrics,
    }
}

fn instance(id: &str, destination: &str) -> DataPlaneInstance {
    DataPlaneInstance::new(id)
        .with_url(format!("http://{}.local:8181/control", id))
        .with_source_type("HttpData")
        .with_destination_type(destination)
        .with_transfer_type("push")
}

fn s3_request() -> TransferRequest {
    TransferRequest::new("HttpData", "AmazonS3", "push")
}

#[test]
fn test_round_robin_alternates_between_two_planes() {
    let h = harness(ROUND_ROBIN, None, 3);
    h.service.register(instance("A", "AmazonS3")).unwrap();
    h.service.register(instance("B", "AmazonS3")).unwrap();

    let picks: Vec<String> = (0..3)
        .map(|_| h.service.select(&s3_request()).unwrap().id.to_string())
        .collect();
    assert_eq!(picks, vec!["A", "B", "A"]);
}

#[test]
fn test_round_robin_keeps_separate_cursor_per_route() {
    let h = harness(ROUND_ROBIN, None, 3);
    h.service.register(instance("A", "AmazonS3")).unwrap();
    h.service.register(instance("B", "AmazonS3")).unwrap();
    h.service.register(instance("C", "AzureStorage")).unwrap();
    h.service.register(instance("D", "AzureStorage")).unwrap();

    let azure = TransferRequest::new("HttpData", "AzureStorage", "push");
    assert_eq!(h.service.select(&s3_request()).unwrap().id.as_str(), "A");
    assert_eq!(h.service.select(&azure).unwrap().id.as_str(), "C");
    assert_eq!(h.service.select(&s3_request()).unwrap().id.as_str(), "B");
    assert_eq!(h.service.select(&azure).unwrap().id.as_str(), "D");
}

#[test]
fn test_deregistered_plane_is_never_selected() {
    let h = harness(ROUND_ROBIN, None, 3);
    h.service.register(instance("A", "AmazonS3")).unwrap();
    assert_eq!(h.service.select(&s3_request()).unwrap().id.as_str(), "A");

    assert!(h.service.deregister(&InstanceId::from("A")));
    let err = h.service.select(&s3_request()).unwrap_err();
    assert!(matches!(err, SelectorError::NoEligibleInstance { .. }));
    assert_eq!(
        h.metrics.counter_total(
            names::SELECTION_TOTAL,
            Some(("outcome", "no_eligible_instance"))
        ),
        1.0
    );
}

#[test]
fn test_hint_for_incapable_plane_is_rejected() {
    let h = harness(ROUND_ROBIN, None, 3);
    h.service.register(instance("A", "AmazonS3")).unwrap();
    h.service.register(instance("C", "AzureStorage")).unwrap();

    let err = h
        .service
        .select(&s3_request().with_hint("C"))
        .unwrap_err();
    assert_eq!(err, SelectorError::HintInstanceUnavailable(InstanceId::from("C")));
}

#[test]
fn test_seeded_random_selection_is_reproducible() {
    let run = || {
        let h = harness(RANDOM, Some(2024), 3);
        for id in ["A", "B", "C"] {
            h.service.register(instance(id, "AmazonS3")).unwrap();
        }
        (0..20)
            .map(|_| h.service.select(&s3_request()).unwrap().id.to_string())
            .collect::<Vec<_>>()
    };

    let first = run();
    assert_eq!(first, run());
    assert!(first.iter().all(|id| ["A", "B", "C"].contains(&id.as_str())));
}

#[test]
fn test_silent_planes_drop_out_and_come_back() {
    let h = harness(ROUND_ROBIN, None, 3);
    h.service.register(instance("A", "AmazonS3")).unwrap();
    h.clock.advance(Duration::from_secs(5));
    h.service.register(instance("B", "AmazonS3")).unwrap();

    // A is 11s old, B is 6s old
    h.clock.advance(Duration::from_secs(6));
    for _ in 0..4 {
        assert_eq!(h.service.select(&s3_request()).unwrap().id.as_str(), "B");
    }

    h.service
        .heartbeat(&InstanceId::from("A"), h.clock.now())
        .unwrap();
    let picks: Vec<String> = (0..2)
        .map(|_| h.service.select(&s3_request()).unwrap().id.to_string())
        .collect();
    assert!(picks.contains(&"A".to_string()));

    let evicted = h.service.evict_silent(Duration::from_secs(3));
    assert_eq!(evicted, vec![InstanceId::from("B")]);
}

#[test]
fn test_transfer_retries_then_fails_permanently() {
    let h = harness(ROUND_ROBIN, None, 2);
    for id in ["A", "B", "C", "D"] {
        h.service.register(instance(id, "AmazonS3")).unwrap();
    }

    let record = h.service.initiate(s3_request()).unwrap();
    let id = record.id;
    let mut used = vec![record.instance_id.clone().unwrap()];

    h.service.on_started(&id).unwrap();
    let first = h.service.on_failed(&id, "connection reset").unwrap();
    assert!(first.is_retrying());
    used.push(first.record().instance_id.clone().unwrap());

    h.service.on_started(&id).unwrap();
    let second = h.service.on_failed(&id, "connection reset").unwrap();
    assert!(second.is_retrying());
    used.push(second.record().instance_id.clone().unwrap());

    h.service.on_started(&id).unwrap();
    let last = h.service.on_failed(&id, "connection reset").unwrap();
    assert!(matches!(last, FailureResolution::Exhausted(_)));

    // Each attempt ran on a different plane
    used.sort();
    used.dedup();
    assert_eq!(used.len(), 3);

    let record = h.service.get_record(&id).unwrap();
    assert_eq!(record.state, TransferState::Failed);
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.last_error.as_deref(), Some("connection reset"));
    assert!(record.is_terminal());

    let err = h.service.on_started(&id).unwrap_err();
    assert!(matches!(err, SelectorError::InvalidTransition { .. }));
}

#[test]
fn test_cancel_after_reselection_and_purge() {
    let h = harness(ROUND_ROBIN, None, 3);
    h.service.register(instance("A", "AmazonS3")).unwrap();
    h.service.register(instance("B", "AmazonS3")).unwrap();

    let record = h.service.initiate(s3_request()).unwrap();
    h.service.on_started(&record.id).unwrap();
    let resolution = h.service.on_failed(&record.id, "timeout").unwrap();
    assert_eq!(resolution.record().state, TransferState::Selected);

    let cancelled = h.service.on_cancelled(&record.id).unwrap();
    assert_eq!(cancelled.state, TransferState::Cancelled);

    // Second cancel is a no-op
    let again = h.service.on_cancelled(&record.id).unwrap();
    assert_eq!(again.updated_at, cancelled.updated_at);

    h.clock.advance(Duration::from_secs(61));
    assert_eq!(h.service.purge_expired(), vec![record.id]);
    assert_eq!(
        h.service.get_record(&record.id).unwrap_err(),
        SelectorError::UnknownTransfer(record.id)
    );
}

/// Cancels a transfer as soon as it fails with a retry pending
struct CancelOnRetry {
    tracker: Weak<TransferTracker>,
}

impl TransferListener for CancelOnRetry {
    fn on_transition(&self, record: &TransferRecord, event: &TransitionEvent) {
        if event.to == TransferState::Failed && record.retry_pending {
            if let Some(tracker) = self.tracker.upgrade() {
                tracker.on_cancelled(&record.id).unwrap();
            }
        }
    }
}

#[test]
fn test_cancel_while_retry_pending_drops_reselection() {
    let h = harness(ROUND_ROBIN, None, 3);
    h.service.register(instance("A", "AmazonS3")).unwrap();
    h.service.register(instance("B", "AmazonS3")).unwrap();
    h.service.tracker().add_listener(Arc::new(CancelOnRetry {
        tracker: Arc::downgrade(h.service.tracker()),
    }));

    let record = h.service.initiate(s3_request()).unwrap();
    assert_eq!(record.instance_id, Some(InstanceId::from("A")));
    h.service.on_started(&record.id).unwrap();

    let resolution = h.service.on_failed(&record.id, "timeout").unwrap();
    let FailureResolution::Cancelled(cancelled) = resolution else {
        panic!("expected cancellation, got {:?}", resolution);
    };
    assert_eq!(cancelled.state, TransferState::Cancelled);
    assert_eq!(cancelled.attempt_count, 0);
    assert_eq!(cancelled.instance_id, Some(InstanceId::from("A")));

    // B was never handed the transfer
    let b = h.service.registry().get(&InstanceId::from("B")).unwrap();
    assert_eq!(b.turn_count, 0);
    assert_eq!(
        h.metrics
            .counter_total(names::SELECTION_TOTAL, Some(("outcome", "selected"))),
        1.0
    );
}

#[test]
fn test_concurrent_selection_and_lifecycle() {
    let h = harness(ROUND_ROBIN, None, 3);
    for id in ["A", "B", "C", "D"] {
        h.service.register(instance(id, "AmazonS3")).unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = h.service.clone();
            thread::spawn(move || {
                let mut picks = Vec::new();
                for _ in 0..50 {
                    let record = service.initiate(s3_request()).unwrap();
                    service.on_started(&record.id).unwrap();
                    service.on_completed(&record.id).unwrap();
                    picks.push(record.instance_id.unwrap());
                }
                picks
            })
        })
        .collect();

    let mut per_instance: HashMap<InstanceId, usize> = HashMap::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            *per_instance.entry(id).or_default() += 1;
        }
    }

    // 400 round-robin selections over 4 planes land evenly
    assert_eq!(per_instance.len(), 4);
    assert!(per_instance.values().all(|&n| n == 100));

    assert_eq!(h.service.tracker().len(), 400);
    assert_eq!(h.service.tracker().active_count(), 0);
    assert_eq!(
        h.metrics.counter_total(
            names::TRANSFER_TRANSITIONS_TOTAL,
            Some(("state", "completed"))
        ),
        400.0
    );
}
