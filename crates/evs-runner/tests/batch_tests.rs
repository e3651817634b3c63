mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{harness, harness_with, key, seed, wait_for_creates, FailingStore, Harness};
use evs_client::CancelSignal;
use evs_core::{BatchStatus, BatchTaskStatus, SubmissionStatus, TaskWindow, ValidationMode, Window};
use evs_runner::{batch_exit_code, BatchError, BatchOptions, BatchOrchestrator, BatchSelection, EXIT_FAILED, EXIT_OK};
use evs_storage::SubmissionStore;

fn orchestrator(h: &Harness) -> BatchOrchestrator {
    BatchOrchestrator::new(h.controller.clone(), "ci-bot")
}

fn seeded(h: &Harness, tasks: &[&str]) -> Vec<TaskWindow> {
    tasks
        .iter()
        .map(|t| {
            let k = key(t);
            seed(&h.evidence, &k);
            k
        })
        .collect()
}

#[tokio::test]
async fn test_checksum_failure_is_isolated_to_its_task() {
    let h = harness();
    let tasks = seeded(&h, &["ET-0001", "ET-0002", "ET-0003"]);
    h.platform.corrupt("ET-0003", "02_users.csv");

    let batch = orchestrator(&h)
        .submit_batch(&BatchSelection::Tasks(tasks), BatchOptions::default(), &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(batch.results.len(), 3);
    assert_eq!(batch.submitted_tasks, 2);
    assert_eq!(batch.failed_tasks, 1);
    assert_eq!(batch.status, BatchStatus::CompletedWithFailures);
    let failed = batch
        .results
        .iter()
        .find(|r| r.status == BatchTaskStatus::Failed)
        .unwrap();
    assert_eq!(failed.task_ref.as_str(), "ET-0003");
    assert_eq!(failed.error_code.as_deref(), Some("CHECKSUM_MISMATCH"));
    assert!(failed.error.as_deref().unwrap().contains("checksum mismatch"));
    assert_eq!(batch_exit_code(&batch), EXIT_FAILED);

    let persisted = h.store.load_batch(&batch.batch_id).unwrap().unwrap();
    assert_eq!(persisted, batch);
    assert!(persisted.completed_at.is_some());
}

#[tokio::test]
async fn test_stop_on_error_skips_undispatched_tasks() {
    let h = harness();
    let tasks = seeded(&h, &["ET-0001", "ET-0103", "ET-0002"]);
    let opts = BatchOptions {
        continue_on_error: false,
        concurrency: 1,
        ..BatchOptions::default()
    };

    let batch = orchestrator(&h)
        .submit_batch(&BatchSelection::Tasks(tasks), opts, &CancelSignal::new())
        .await
        .unwrap();

    let statuses: Vec<_> = batch.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![BatchTaskStatus::Success, BatchTaskStatus::Failed, BatchTaskStatus::Skipped]
    );
    assert_eq!(batch.results[1].error_code.as_deref(), Some("VALIDATION_FAILED"));
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.skipped_tasks, 1);
}

#[tokio::test]
async fn test_retry_reruns_only_failed_tasks_under_same_id() {
    let h = harness();
    let tasks = seeded(&h, &["ET-0001", "ET-0002", "ET-0003"]);
    h.platform.corrupt("ET-0003", "01_roles.md");
    let orch = orchestrator(&h);

    let first = orch
        .submit_batch(&BatchSelection::Tasks(tasks), BatchOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(first.failed_tasks, 1);
    let creates_before = h.platform.creates.load(Ordering::SeqCst);

    h.platform.heal();
    let retried = orch
        .retry_failed(&first.batch_id, 2, &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(retried.batch_id, first.batch_id);
    assert_eq!(retried.submitted_tasks, 3);
    assert_eq!(retried.status, BatchStatus::Completed);
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), creates_before + 1);
    assert_eq!(batch_exit_code(&retried), EXIT_OK);
    assert_eq!(orch.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_validated_in_window_selects_only_validated_records() {
    let h = harness();
    let tasks = seeded(&h, &["ET-0001", "ET-0002", "ET-0103"]);
    for k in &tasks {
        h.controller.validate(k, ValidationMode::Strict).unwrap();
    }
    let other_window = TaskWindow::new("ET-0004", "2025-Q3");
    seed(&h.evidence, &other_window);
    h.controller.validate(&other_window, ValidationMode::Strict).unwrap();

    let orch = orchestrator(&h);
    let selection = BatchSelection::ValidatedInWindow(Window::new("2025-Q4"));
    assert_eq!(orch.resolve(&selection).unwrap(), vec![key("ET-0001"), key("ET-0002")]);

    let batch = orch
        .submit_batch(&selection, BatchOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(batch.total_tasks, 2);
    assert_eq!(batch.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_batch_dispatches_nothing() {
    let h = harness();
    let tasks = seeded(&h, &["ET-0001", "ET-0002"]);
    let cancel = CancelSignal::new();
    cancel.cancel();

    let batch = orchestrator(&h)
        .submit_batch(&BatchSelection::Tasks(tasks), BatchOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.skipped_tasks, 2);
    assert_eq!(h.platform.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_duplicate_tasks_are_submitted_once() {
    let h = harness();
    let tasks = seeded(&h, &["ET-0001", "ET-0002", "ET-0001"]);
    let batch = orchestrator(&h)
        .submit_batch(&BatchSelection::Tasks(tasks), BatchOptions::default(), &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(batch.total_tasks, 2);
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_selection_is_an_error() {
    let h = harness();
    let err = orchestrator(&h)
        .submit_batch(
            &BatchSelection::ValidatedInWindow(Window::new("2025-Q4")),
            BatchOptions::default(),
            &CancelSignal::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Empty));
}

#[tokio::test]
async fn test_cancel_mid_batch_lets_in_flight_task_finish() {
    let h = harness();
    let tasks = seeded(&h, &["ET-0001", "ET-0002", "ET-0003"]);
    *h.platform.create_delay.lock().unwrap() = Some(Duration::from_millis(200));
    let opts = BatchOptions {
        concurrency: 1,
        ..BatchOptions::default()
    };

    let cancel = CancelSignal::new();
    let orch = orchestrator(&h);
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { orch.submit_batch(&BatchSelection::Tasks(tasks), opts, &cancel).await })
    };
    wait_for_creates(&h.platform, 1).await;
    cancel.cancel();
    let batch = run.await.unwrap().unwrap();

    let statuses: Vec<_> = batch.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![BatchTaskStatus::Success, BatchTaskStatus::Skipped, BatchTaskStatus::Skipped]
    );
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert!(batch.results[2].error.as_deref().unwrap().contains("cancelled"));
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.store.load_submission(&key("ET-0001")).unwrap().unwrap().status,
        SubmissionStatus::Submitted
    );
    assert!(h.store.load_submission(&key("ET-0002")).unwrap().is_none());
}

#[tokio::test]
async fn test_manifest_write_failure_drains_workers_and_returns_ledger() {
    // Save #1 is the initial manifest, #2 marks it running, #3 follows the first completion.
    let h = harness_with(|s| FailingStore {
        fail_batch_save_at: Some(3),
        ..FailingStore::new(s)
    });
    let tasks = seeded(&h, &["ET-0001", "ET-0002", "ET-0003"]);
    *h.platform.create_delay.lock().unwrap() = Some(Duration::from_millis(200));
    let opts = BatchOptions {
        concurrency: 2,
        ..BatchOptions::default()
    };

    let err = orchestrator(&h)
        .submit_batch(&BatchSelection::Tasks(tasks), opts, &CancelSignal::new())
        .await
        .unwrap_err();
    let batch = match err {
        BatchError::Persistence { batch, .. } => batch,
        other => panic!("expected a persistence error, got {other:?}"),
    };

    // Both dispatched tasks ran to completion; the queued one never started.
    assert_eq!(batch.submitted_tasks, 2);
    assert_eq!(batch.skipped_tasks, 1);
    let skipped = batch
        .results
        .iter()
        .find(|r| r.status == BatchTaskStatus::Skipped)
        .unwrap();
    assert_eq!(skipped.task_ref.as_str(), "ET-0003");
    assert!(skipped.error.as_deref().unwrap().contains("manifest"));
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(h.platform.creates.load(Ordering::SeqCst), 2);
    for task in ["ET-0001", "ET-0002"] {
        let s = h.store.load_submission(&key(task)).unwrap().unwrap();
        assert_eq!(s.status, SubmissionStatus::Submitted, "{task}");
    }

    // The final write went through, so the manifest on disk matches the returned ledger.
    let persisted = h.store.load_batch(&batch.batch_id).unwrap().unwrap();
    assert_eq!(persisted, *batch);
}
