use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use evs_client::CancelSignal;
use evs_core::{
    BatchId, BatchStatus, BatchSubmissionResult, BatchTaskStatus, EvidenceSubmission, SubmissionBatch, TaskWindow,
    ValidationMode, Window,
};
use evs_storage::StoreError;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::controller::{SubmitOptions, TaskController};
use crate::error::{BatchError, TaskError};

/// Which tasks a batch covers.
#[derive(Clone, Debug)]
pub enum BatchSelection {
    Tasks(Vec<TaskWindow>),
    /// Every active record in `validated` status for the window.
    ValidatedInWindow(Window),
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    pub name: Option<String>,
    pub mode: ValidationMode,
    pub continue_on_error: bool,
    pub concurrency: usize,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            name: None,
            mode: ValidationMode::Strict,
            continue_on_error: true,
            concurrency: 4,
            notes: None,
            tags: vec![],
        }
    }
}

/// Fans task submissions out to a bounded set of workers. Only the
/// dispatching loop touches the manifest; workers hand back results.
pub struct BatchOrchestrator {
    controller: Arc<TaskController>,
    created_by: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Failure,
    Persistence,
}

impl BatchOrchestrator {
    pub fn new(controller: Arc<TaskController>, created_by: impl Into<String>) -> Self {
        Self {
            controller,
            created_by: created_by.into(),
        }
    }

    /// Concrete task list for a selection, first occurrence wins.
    pub fn resolve(&self, selection: &BatchSelection) -> Result<Vec<TaskWindow>, BatchError> {
        let tasks = match selection {
            BatchSelection::Tasks(tasks) => tasks.clone(),
            BatchSelection::ValidatedInWindow(window) => self.controller.validated_in_window(window)?,
        };
        let mut seen = BTreeSet::new();
        Ok(tasks.into_iter().filter(|t| seen.insert(t.clone())).collect())
    }

    pub async fn submit_batch(
        &self,
        selection: &BatchSelection,
        opts: BatchOptions,
        cancel: &CancelSignal,
    ) -> Result<SubmissionBatch, BatchError> {
        let tasks = self.resolve(selection)?;
        if tasks.is_empty() {
            return Err(BatchError::Empty);
        }
        let now = Utc::now();
        let id = BatchId::generate(now);
        let name = opts.name.clone().unwrap_or_else(|| id.to_string());
        let mut batch = SubmissionBatch::new(
            id,
            name,
            tasks.clone(),
            opts.mode,
            opts.continue_on_error,
            self.created_by.clone(),
            now,
        );
        self.controller.store().save_batch(&batch)?;
        self.run(&mut batch, tasks, &opts, cancel).await?;
        Ok(batch)
    }

    /// Re-run failed, skipped and never-started entries under the same id.
    pub async fn retry_failed(
        &self,
        id: &BatchId,
        concurrency: usize,
        cancel: &CancelSignal,
    ) -> Result<SubmissionBatch, BatchError> {
        let mut batch = self.load(id)?;
        let todo: Vec<TaskWindow> = batch
            .results
            .iter()
            .filter(|r| r.status != BatchTaskStatus::Success)
            .map(BatchSubmissionResult::key)
            .collect();
        if todo.is_empty() {
            info!(batch = %id, "nothing to retry");
            return Ok(batch);
        }
        let opts = BatchOptions {
            name: Some(batch.name.clone()),
            mode: batch.validation_mode,
            continue_on_error: batch.continue_on_error,
            concurrency,
            ..BatchOptions::default()
        };
        self.run(&mut batch, todo, &opts, cancel).await?;
        Ok(batch)
    }

    pub fn load(&self, id: &BatchId) -> Result<SubmissionBatch, BatchError> {
        self.controller
            .store()
            .load_batch(id)?
            .ok_or_else(|| BatchError::NotFound(id.clone()))
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<SubmissionBatch>, BatchError> {
        Ok(self.controller.store().list_batches()?)
    }

    async fn run(
        &self,
        batch: &mut SubmissionBatch,
        todo: Vec<TaskWindow>,
        opts: &BatchOptions,
        cancel: &CancelSignal,
    ) -> Result<(), BatchError> {
        let store = self.controller.store().clone();
        let concurrency = opts.concurrency.max(1);

        for key in &todo {
            if let Some(r) = batch.result_mut(key) {
                *r = BatchSubmissionResult::pending(key);
            }
        }
        batch.status = BatchStatus::Running;
        batch.started_at.get_or_insert_with(Utc::now);
        batch.completed_at = None;
        batch.recount();
        store.save_batch(batch)?;
        info!(
            batch = %batch.batch_id,
            tasks = todo.len(),
            concurrency,
            continue_on_error = opts.continue_on_error,
            "batch started"
        );

        let mut queue: VecDeque<TaskWindow> = todo.into();
        let mut workers: JoinSet<(TaskWindow, Result<EvidenceSubmission, TaskError>)> = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut stop: Option<StopReason> = None;
        let mut persist_error: Option<StoreError> = None;
        let batch_id = batch.batch_id.clone();

        loop {
            while stop.is_none() && workers.len() < concurrency {
                if queue.is_empty() {
                    break;
                }
                if cancel.is_cancelled() {
                    stop = Some(StopReason::Cancelled);
                    break;
                }
                let Some(key) = queue.pop_front() else { break };
                let controller = self.controller.clone();
                let submit_opts = SubmitOptions {
                    mode: opts.mode,
                    batch_id: Some(batch_id.clone()),
                    notes: opts.notes.clone(),
                    tags: opts.tags.clone(),
                };
                let worker_cancel = cancel.clone();
                let worker_key = key.clone();
                let handle = workers.spawn(async move {
                    let outcome = controller.submit(&worker_key, submit_opts, &worker_cancel).await;
                    (worker_key, outcome)
                });
                in_flight.insert(handle.id(), key);
            }

            let Some(joined) = workers.join_next_with_id().await else { break };
            let (key, outcome) = match joined {
                Ok((id, (key, outcome))) => {
                    in_flight.remove(&id);
                    (key, outcome.map_err(|e| (e.code().to_string(), e.to_string())))
                }
                Err(join_err) => {
                    let Some(key) = in_flight.remove(&join_err.id()) else { continue };
                    (key, Err(("WORKER_ABORTED".to_string(), join_err.to_string())))
                }
            };

            let Some(result) = batch.result_mut(&key) else { continue };
            result.finished_at = Some(Utc::now());
            match outcome {
                Ok(s) => {
                    result.status = BatchTaskStatus::Success;
                    result.submission_id = s.remote_submission_id;
                    result.error_code = None;
                    result.error = None;
                }
                Err((code, message)) => {
                    warn!(batch = %batch_id, task = %key, code = %code, error = %message, "batch task failed");
                    result.status = BatchTaskStatus::Failed;
                    result.error_code = Some(code);
                    result.error = Some(message);
                    if !opts.continue_on_error && stop.is_none() {
                        stop = Some(StopReason::Failure);
                    }
                }
            }
            batch.recount();
            // A failed write must not drop `workers`: that would abort tasks mid-call.
            if let Err(e) = store.save_batch(batch) {
                error!(batch = %batch_id, error = %e, "could not write batch manifest, draining in-flight tasks");
                stop.get_or_insert(StopReason::Persistence);
                persist_error.get_or_insert(e);
            }
        }

        let skipped_because = match stop {
            Some(StopReason::Cancelled) => "not started: batch cancelled",
            Some(StopReason::Persistence) => "not started: batch manifest could not be written",
            _ => "not started: an earlier task failed and continue_on_error is off",
        };
        for key in queue {
            if let Some(r) = batch.result_mut(&key) {
                r.status = BatchTaskStatus::Skipped;
                r.error = Some(skipped_because.to_string());
            }
        }

        batch.recount();
        batch.status = match stop {
            Some(StopReason::Cancelled) => BatchStatus::Cancelled,
            _ if batch.submitted_tasks == batch.total_tasks => BatchStatus::Completed,
            Some(StopReason::Failure | StopReason::Persistence) => BatchStatus::Failed,
            None if batch.submitted_tasks == 0 => BatchStatus::Failed,
            None => BatchStatus::CompletedWithFailures,
        };
        batch.completed_at = Some(Utc::now());
        if let Err(e) = store.save_batch(batch) {
            error!(batch = %batch_id, error = %e, "could not write final batch manifest");
            persist_error.get_or_insert(e);
        }
        info!(
            batch = %batch.batch_id,
            status = ?batch.status,
            submitted = batch.submitted_tasks,
            failed = batch.failed_tasks,
            skipped = batch.skipped_tasks,
            "batch finished"
        );
        match persist_error {
            None => Ok(()),
            Some(source) => Err(BatchError::Persistence {
                batch: Box::new(batch.clone()),
                source,
            }),
        }
    }
}
