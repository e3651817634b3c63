mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{controller_over, controller_parts, file, harness, harness_with, key, seed, wait_for_creates, FailingStore};
use evs_client::CancelSignal;
use evs_core::{
    EvidenceSubmission, RemoteIdPolicy, RemoteOutcome, Severity, SubmissionStatus, ValidationMode,
};
use evs_runner::{SubmitOptions, TaskError};
use evs_storage::{EvidenceSource, SubmissionStore};

fn history_notes(h: &common::Harness, k: &evs_core::TaskWindow) -> Vec<String> {
    h.store
        .load_history(k)
        .unwrap()
        .into_iter()
        .filter_map(|e| e.notes)
        .collect()
}

#[tokio::test]
async fn test_clean_bundle_validates_submits_and_is_accepted() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);

    let report = h.controller.validate(&k, ValidationMode::Strict).unwrap();
    assert!(report.ready_for_submission, "{:?}", report.findings);
    assert_eq!(report.completeness_score, 1.0);

    let s = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(s.status, SubmissionStatus::Submitted);
    let remote_id = s.remote_submission_id.clone().unwrap();
    assert_eq!(s.total_file_count, 3);
    assert_eq!(h.platform.uploads.load(Ordering::SeqCst), 3);

    let pending = h.controller.poll_status(&k).await.unwrap();
    assert_eq!(pending.status, SubmissionStatus::Submitted);

    h.platform.verdict(&remote_id, "accepted", None);
    let accepted = h.controller.poll_status(&k).await.unwrap();
    assert_eq!(accepted.status, SubmissionStatus::Accepted);
    assert!(accepted.resolved_at.is_some());

    let view = h.controller.status(&k).unwrap();
    let statuses: Vec<_> = view.history.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![SubmissionStatus::Submitted, SubmissionStatus::Accepted]);
    assert!(view.history.iter().all(|e| !e.validation_bypassed));
}

#[tokio::test]
async fn test_missing_control_is_refused_before_any_network_call() {
    let h = harness();
    let k = key("ET-0103");
    seed(&h.evidence, &k);

    let report = h.controller.validate(&k, ValidationMode::Strict).unwrap();
    assert!(!report.ready_for_submission);
    let errors: Vec<_> = report.findings_with(Severity::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "CONTROLS_COVERAGE");

    let err = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap_err();
    match &err {
        TaskError::ValidationFailed { report, .. } => {
            assert!(report.findings.iter().any(|f| f.code == "CONTROLS_COVERAGE"))
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert_eq!(err.code(), "VALIDATION_FAILED");
    assert!(err.remediation().unwrap().contains("CONTROLS_COVERAGE"));
    assert_eq!(h.platform.uploads.load(Ordering::SeqCst), 0);
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), 0);

    let stored = h.store.load_submission(&k).unwrap().unwrap();
    assert_eq!(stored.status, SubmissionStatus::ValidationFailed);
}

#[tokio::test]
async fn test_editing_evidence_reverts_validated_to_draft() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    let first = h.controller.validate(&k, ValidationMode::Strict).unwrap();
    assert_eq!(
        h.store.load_submission(&k).unwrap().unwrap().status,
        SubmissionStatus::Validated
    );

    h.evidence
        .put_file(&k, file("01_roles.md", &["CC6.1"]), "# IAM roles\n\nReviewed again in December.\n")
        .unwrap();
    assert!(h.controller.status(&k).unwrap().evidence_changed);

    let s = h.controller.record_edit(&k).unwrap();
    assert_eq!(s.status, SubmissionStatus::Draft);
    assert!(s.validation.is_none());
    assert!(!h.controller.status(&k).unwrap().evidence_changed);

    let second = h.controller.validate(&k, ValidationMode::Strict).unwrap();
    assert_ne!(first.fileset_checksum, second.fileset_checksum);
}

#[tokio::test]
async fn test_edit_is_detected_without_notification() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    h.controller.validate(&k, ValidationMode::Strict).unwrap();

    h.evidence.remove_file(&k, "03_policy.json").unwrap();
    let report = h.controller.validate(&k, ValidationMode::Strict).unwrap();
    assert!(report.ready_for_submission);
    let s = h.store.load_submission(&k).unwrap().unwrap();
    assert_eq!(s.total_file_count, 2);
    assert_eq!(s.validation.as_ref().unwrap().fileset_checksum, s.fileset_checksum());
    let notes: Vec<_> = h
        .store
        .load_history(&k)
        .unwrap()
        .into_iter()
        .filter_map(|e| e.notes)
        .collect();
    assert_eq!(notes, vec!["evidence edited".to_string()]);
}

#[tokio::test]
async fn test_concurrent_attempt_fails_fast_with_in_progress() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    *h.platform.create_delay.lock().unwrap() = Some(Duration::from_millis(500));

    let controller = h.controller.clone();
    let first_key = k.clone();
    let first = tokio::spawn(async move {
        controller
            .submit(&first_key, SubmitOptions::default(), &CancelSignal::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = h.controller.validate(&k, ValidationMode::Strict).unwrap_err();
    assert!(matches!(err, TaskError::InProgress { .. }), "{err:?}");
    assert_eq!(err.code(), "SUBMISSION_IN_PROGRESS");

    let s = first.await.unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::Submitted);
}

#[tokio::test]
async fn test_bypass_is_recorded_in_history() {
    let h = harness();
    let k = key("ET-0103");
    seed(&h.evidence, &k);

    let opts = SubmitOptions {
        mode: ValidationMode::Skip,
        notes: Some("auditor asked for partial evidence".into()),
        ..SubmitOptions::default()
    };
    let s = h.controller.submit(&k, opts, &CancelSignal::new()).await.unwrap();
    assert_eq!(s.status, SubmissionStatus::Submitted);

    let history = h.store.load_history(&k).unwrap();
    let last = history.last().unwrap();
    assert!(last.validation_bypassed);
    assert_eq!(last.notes.as_deref(), Some("auditor asked for partial evidence"));
    assert!(h.store.load_validation(&k).unwrap().unwrap().bypassed);
}

#[tokio::test]
async fn test_rejected_submission_is_superseded_on_resubmit() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    let first = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    let first_remote = first.remote_submission_id.clone().unwrap();

    h.platform
        .verdict(&first_remote, "rejected", Some("screenshots predate window"));
    let rejected = h.controller.poll_status(&k).await.unwrap();
    assert_eq!(rejected.status, SubmissionStatus::Rejected);
    assert_eq!(
        rejected.remote_response.unwrap().outcome,
        Some(RemoteOutcome::Rejected {
            reason: "screenshots predate window".into()
        })
    );

    let second = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(second.status, SubmissionStatus::Submitted);
    assert_eq!(second.supersedes.as_ref(), Some(&first.local_id));
    assert_ne!(second.remote_submission_id.as_ref(), Some(&first_remote));
    assert_eq!(h.platform.last_request().replaces, None);

    let archived: Vec<EvidenceSubmission> = h.store.list_superseded(&k).unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].status, SubmissionStatus::Rejected);
    assert_eq!(h.platform.records.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_reuse_policy_asks_platform_to_replace_old_id() {
    let h = controller_parts(RemoteIdPolicy::Reuse, true);
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    let first = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    let first_remote = first.remote_submission_id.unwrap();
    h.platform.verdict(&first_remote, "rejected", Some("wrong quarter"));
    h.controller.poll_status(&k).await.unwrap();

    h.controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(h.platform.last_request().replaces, Some(first_remote.to_string()));
}

#[tokio::test]
async fn test_resubmitting_accepted_evidence_is_an_invalid_transition() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    let s = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    h.platform.verdict(s.remote_submission_id.as_ref().unwrap(), "accepted", None);
    h.controller.poll_status(&k).await.unwrap();

    let err = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_rejection_on_create_marks_submission_failed() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    *h.platform.reject_with.lock().unwrap() = Some("collection window is closed".into());

    let err = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap_err();
    match &err {
        TaskError::RemoteRejection { reason, .. } => assert_eq!(reason, "collection window is closed"),
        other => panic!("expected remote rejection, got {other:?}"),
    }
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), 1);
    let s = h.store.load_submission(&k).unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::SubmissionFailed);
    let last = h.store.load_history(&k).unwrap().pop().unwrap();
    assert_eq!(last.status, SubmissionStatus::SubmissionFailed);
    assert!(last.notes.unwrap().starts_with("REMOTE_REJECTION"));
}

#[tokio::test]
async fn test_submit_without_credentials_is_a_configuration_error() {
    let h = controller_parts(RemoteIdPolicy::MintNew, false);
    let k = key("ET-0001");
    seed(&h.evidence, &k);

    let err = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Configuration { .. }), "{err:?}");
    assert!(h.store.load_submission(&k).unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let h = harness();
    let k = key("ET-0404");
    let err = h.controller.validate(&k, ValidationMode::Strict).unwrap_err();
    assert_eq!(err.code(), "TASK_NOT_FOUND");
    assert!(matches!(h.controller.status(&k), Err(TaskError::NotFound { .. })));
}

#[tokio::test]
async fn test_record_left_in_flight_is_recovered() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    let files = h.evidence.list_task_files(&k).unwrap();
    let mut stuck = EvidenceSubmission::draft(&k, files, "alice", chrono::Utc::now());
    stuck.status = SubmissionStatus::Submitting;
    h.store.save_submission(&stuck).unwrap();

    let report = h.controller.validate(&k, ValidationMode::Strict).unwrap();
    assert!(report.ready_for_submission);
    let history = h.store.load_history(&k).unwrap();
    assert_eq!(history[0].status, SubmissionStatus::SubmissionFailed);
    assert_eq!(history[0].notes.as_deref(), Some("recovered from interrupted submitting"));
}

#[tokio::test]
async fn test_second_controller_on_shared_store_refuses_while_first_is_submitting() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    *h.platform.create_delay.lock().unwrap() = Some(Duration::from_millis(300));
    let peer = controller_over(
        h.store.clone(),
        h.evidence.clone(),
        h.platform.clone(),
        "scheduler",
        RemoteIdPolicy::MintNew,
        true,
    );

    let controller = h.controller.clone();
    let first_key = k.clone();
    let first = tokio::spawn(async move {
        controller
            .submit(&first_key, SubmitOptions::default(), &CancelSignal::new())
            .await
    });
    wait_for_creates(&h.platform, 1).await;
    assert_eq!(
        h.store.load_submission(&k).unwrap().unwrap().status,
        SubmissionStatus::Submitting
    );

    let err = peer
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::InProgress { .. }), "{err:?}");
    assert!(matches!(peer.validate(&k, ValidationMode::Strict), Err(TaskError::InProgress { .. })));

    let s = first.await.unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::Submitted);
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), 1);
    let history = h.store.load_history(&k).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SubmissionStatus::Submitted);

    // Released once the first attempt finished.
    let polled = peer.poll_status(&k).await.unwrap();
    assert_eq!(polled.status, SubmissionStatus::Submitted);
}

#[tokio::test]
async fn test_live_lease_blocks_recovery_and_expired_lease_allows_it() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    let files = h.evidence.list_task_files(&k).unwrap();
    let mut stuck = EvidenceSubmission::draft(&k, files, "alice", chrono::Utc::now());
    stuck.status = SubmissionStatus::Submitting;
    h.store.save_submission(&stuck).unwrap();

    let live = h.store.try_acquire_lease(&k, "other host", 600).unwrap().unwrap();
    let err = h.controller.validate(&k, ValidationMode::Strict).unwrap_err();
    assert_eq!(err.code(), "SUBMISSION_IN_PROGRESS");
    assert_eq!(
        h.store.load_submission(&k).unwrap().unwrap().status,
        SubmissionStatus::Submitting
    );
    h.store.release_lease(&live).unwrap();

    // A holder that died leaves a lease that runs out.
    h.store.try_acquire_lease(&k, "crashed", 0).unwrap().unwrap();
    let s = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(s.status, SubmissionStatus::Submitted);
    assert_eq!(history_notes(&h, &k)[0], "recovered from interrupted submitting");
}

#[tokio::test]
async fn test_metadata_only_edit_invalidates_validation() {
    let h = harness();
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    assert!(h.controller.validate(&k, ValidationMode::Strict).unwrap().ready_for_submission);

    // Same bytes, but the generator now maps the CSV to a different control.
    h.evidence
        .put_file(&k, file("02_users.csv", &["CC6.1"]), "user,role\nalice,admin\nbob,viewer\n")
        .unwrap();
    assert!(h.controller.status(&k).unwrap().evidence_changed);

    let report = h.controller.validate(&k, ValidationMode::Strict).unwrap();
    assert!(!report.ready_for_submission);
    assert!(report.findings.iter().any(|f| f.code == "CONTROLS_COVERAGE"));
    let s = h.store.load_submission(&k).unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::ValidationFailed);
    assert_eq!(s.controls_covered(), vec!["CC6.1".to_string()]);
    assert!(history_notes(&h, &k).contains(&"evidence edited".to_string()));
}

#[tokio::test]
async fn test_original_cause_survives_a_failed_failure_record() {
    let h = harness_with(|store| FailingStore {
        fail_status_save: Some(SubmissionStatus::SubmissionFailed),
        ..FailingStore::new(store)
    });
    let k = key("ET-0001");
    seed(&h.evidence, &k);
    h.platform.corrupt("ET-0001", "01_roles.md");

    let err = h
        .controller
        .submit(&k, SubmitOptions::default(), &CancelSignal::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CHECKSUM_MISMATCH", "{err:?}");
    // Nothing recorded, so the next holder recovers it.
    assert_eq!(
        h.store.load_submission(&k).unwrap().unwrap().status,
        SubmissionStatus::Submitting
    );
    assert!(h.store.load_history(&k).unwrap().is_empty());
}
