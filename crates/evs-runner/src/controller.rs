use std::sync::Arc;

use chrono::Utc;
use evs_client::{CancelSignal, FileUpload, SubmissionClient};
use evs_core::{
    is_in_flight, next_status, sha256_hex, BatchId, EvidenceFileRef, EvidenceSubmission,
    RemoteIdPolicy, RemoteOutcome, RemoteResponse, RemoteSubmissionId, SubmissionEvent, SubmissionHistoryEntry,
    SubmissionStatus, TaskWindow, ValidationMode, ValidationOutcome, ValidationReport, Window,
};
use evs_storage::{EvidenceSource, StoreError, SubmissionStore, TaskCatalog};
use evs_validate::{is_text_extension, ValidateInput, ValidationEngine};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::lease::LeaseGuard;

/// Per-call submission settings. `mode = Skip` submits without validation
/// and records the bypass in history.
#[derive(Clone, Debug, Default)]
pub struct SubmitOptions {
    pub mode: ValidationMode,
    pub batch_id: Option<BatchId>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

/// Read-only snapshot returned by [`TaskController::status`].
#[derive(Clone, Debug, Serialize)]
pub struct StatusView {
    pub key: TaskWindow,
    pub submission: Option<EvidenceSubmission>,
    pub validation: Option<ValidationReport>,
    pub history: Vec<SubmissionHistoryEntry>,
    pub superseded: Vec<EvidenceSubmission>,
    /// Evidence on disk differs from the recorded file set.
    pub evidence_changed: bool,
}

/// Drives one task/window through validate, submit and poll.
///
/// Every mutating operation holds the task/window lease from the store for its
/// whole duration, so writes to one record are serialized across every
/// controller and process sharing that store. A record found in flight while
/// the lease is free was left behind by a holder that died.
pub struct TaskController {
    store: Arc<dyn SubmissionStore>,
    evidence: Arc<dyn EvidenceSource>,
    catalog: Arc<dyn TaskCatalog>,
    engine: Arc<ValidationEngine>,
    client: Option<SubmissionClient>,
    lease_owner: String,
    lease_ttl_secs: i64,
    submitted_by: String,
    remote_id_policy: RemoteIdPolicy,
    max_content_bytes: u64,
}

impl TaskController {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        evidence: Arc<dyn EvidenceSource>,
        catalog: Arc<dyn TaskCatalog>,
        engine: Arc<ValidationEngine>,
        submitted_by: impl Into<String>,
    ) -> Self {
        let submitted_by = submitted_by.into();
        Self {
            store,
            evidence,
            catalog,
            engine,
            client: None,
            lease_owner: format!("{submitted_by} (pid {})", std::process::id()),
            lease_ttl_secs: 15 * 60,
            submitted_by,
            remote_id_policy: RemoteIdPolicy::default(),
            max_content_bytes: 50 * 1024 * 1024,
        }
    }

    pub fn with_client(mut self, client: SubmissionClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_remote_id_policy(mut self, policy: RemoteIdPolicy) -> Self {
        self.remote_id_policy = policy;
        self
    }

    /// Files larger than this are not loaded for content checks.
    pub fn with_max_content_bytes(mut self, max: u64) -> Self {
        self.max_content_bytes = max;
        self
    }

    /// How long a task/window stays claimed if the holder dies without releasing it.
    /// Must exceed the longest submit, retries included.
    pub fn with_lease_ttl(mut self, secs: u64) -> Self {
        self.lease_ttl_secs = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    fn lock(&self, key: &TaskWindow) -> Result<LeaseGuard, TaskError> {
        let lease = self
            .store
            .try_acquire_lease(key, &self.lease_owner, self.lease_ttl_secs)
            .map_err(|e| TaskError::store(key, e))?;
        match lease {
            Some(lease) => Ok(LeaseGuard::new(self.store.clone(), lease)),
            None => {
                debug!(task = %key, "task/window leased by another operation");
                Err(TaskError::InProgress { key: key.clone() })
            }
        }
    }

    fn client(&self, key: &TaskWindow) -> Result<&SubmissionClient, TaskError> {
        self.client.as_ref().ok_or_else(|| TaskError::Configuration {
            key: key.clone(),
            message: "no bearer credential configured for the remote platform".into(),
        })
    }

    fn save(&self, s: &EvidenceSubmission) -> Result<(), TaskError> {
        self.store
            .save_submission(s)
            .map_err(|e| TaskError::store(&s.key(), e))
    }

    fn record(&self, entry: SubmissionHistoryEntry, key: &TaskWindow) -> Result<(), TaskError> {
        self.store
            .append_history(key, &entry)
            .map_err(|e| TaskError::store(key, e))
    }

    /// Apply one lifecycle event and persist the result.
    fn transition(&self, s: &mut EvidenceSubmission, event: SubmissionEvent) -> Result<(), TaskError> {
        let key = s.key();
        let next = next_status(s.status, event).map_err(|e| TaskError::transition(&key, e))?;
        debug!(task = %key, from = %s.status, to = %next, event = event.as_str(), "transition");
        s.status = next;
        self.save(s)
    }

    fn list_files(&self, key: &TaskWindow) -> Result<Vec<EvidenceFileRef>, TaskError> {
        self.evidence
            .list_task_files(key)
            .map_err(|e| TaskError::store(key, e))
    }

    /// Current record for `key`, creating a draft on first sight. Recovers
    /// records a dead process left in flight and picks up evidence edits.
    fn load_or_draft(&self, key: &TaskWindow) -> Result<EvidenceSubmission, TaskError> {
        let listing = self.list_files(key)?;
        let now = Utc::now();
        let stored = self
            .store
            .load_submission(key)
            .map_err(|e| TaskError::store(key, e))?;
        let Some(mut s) = stored else {
            let s = EvidenceSubmission::draft(key, listing, self.submitted_by.clone(), now);
            debug!(task = %key, local_id = %s.local_id, files = s.total_file_count, "new draft");
            self.save(&s)?;
            return Ok(s);
        };

        if is_in_flight(s.status) {
            let was = s.status;
            warn!(task = %key, status = %was, "recovering submission left in flight");
            self.transition(&mut s, SubmissionEvent::Interrupted)?;
            self.record(
                SubmissionHistoryEntry::for_submission(&s, now).with_notes(format!("recovered from interrupted {was}")),
                key,
            )?;
        }

        if s.evidence_differs(&listing) {
            debug!(task = %key, "evidence changed since last recorded");
            s = self.apply_edit(s, listing)?;
        }
        Ok(s)
    }

    /// Invalidate `s` for a new file set. Records already sent to the platform
    /// are archived and replaced by a superseding draft.
    fn apply_edit(
        &self,
        mut s: EvidenceSubmission,
        files: Vec<EvidenceFileRef>,
    ) -> Result<EvidenceSubmission, TaskError> {
        let key = s.key();
        let now = Utc::now();
        if s.status.is_remote() {
            self.supersede(&s, files, format!("evidence edited after {}", s.status))
        } else {
            self.transition(&mut s, SubmissionEvent::EvidenceEdited)?;
            s.replace_files(files);
            s.validation = None;
            s.validated_at = None;
            self.save(&s)?;
            self.record(
                SubmissionHistoryEntry::for_submission(&s, now).with_notes("evidence edited"),
                &key,
            )?;
            Ok(s)
        }
    }

    fn supersede(
        &self,
        previous: &EvidenceSubmission,
        files: Vec<EvidenceFileRef>,
        reason: String,
    ) -> Result<EvidenceSubmission, TaskError> {
        let key = previous.key();
        self.store
            .archive_submission(previous)
            .map_err(|e| TaskError::store(&key, e))?;
        let next = EvidenceSubmission::superseding(previous, files, Utc::now());
        info!(task = %key, previous = %previous.local_id, local_id = %next.local_id, "superseding submission");
        self.save(&next)?;
        self.record(
            SubmissionHistoryEntry::for_submission(&next, next.created_at)
                .with_notes(format!("{reason}; supersedes {}", previous.local_id)),
            &key,
        )?;
        Ok(next)
    }

    fn validate_input(&self, s: &EvidenceSubmission) -> Result<ValidateInput, TaskError> {
        let key = s.key();
        let mut input = ValidateInput::new(&key, s.files.clone())
            .with_required_controls(self.catalog.required_controls(&s.task_ref))
            .with_plan(
                self.evidence
                    .collection_plan(&key)
                    .map_err(|e| TaskError::store(&key, e))?,
            );
        for f in &s.files {
            let text = f.extension().is_some_and(|e| is_text_extension(&e));
            if text && f.size_bytes <= self.max_content_bytes {
                let bytes = self
                    .evidence
                    .read_file(&key, &f.filename)
                    .map_err(|e| TaskError::store(&key, e))?;
                input = input.with_content(f.filename.clone(), bytes);
            }
        }
        Ok(input)
    }

    fn run_validation(&self, s: &mut EvidenceSubmission, mode: ValidationMode) -> Result<ValidationReport, TaskError> {
        self.transition(s, SubmissionEvent::ValidateRequested)?;
        let input = match self.validate_input(s) {
            Ok(input) => input,
            Err(e) => {
                self.transition(s, SubmissionEvent::Interrupted)?;
                return Err(e);
            }
        };
        let report = self.engine.run(&input, mode, Utc::now());
        self.store
            .save_validation(&report)
            .map_err(|e| TaskError::store(&report.key(), e))?;
        s.validation = Some(ValidationOutcome::from(&report));
        s.validated_at = Some(report.validated_at);
        let event = if report.ready_for_submission {
            SubmissionEvent::ValidationPassed
        } else {
            SubmissionEvent::ValidationFailed
        };
        self.transition(s, event)?;
        Ok(report)
    }

    /// Validate the current bundle. Records already sent to the platform are
    /// evaluated without touching their state.
    pub fn validate(&self, key: &TaskWindow, mode: ValidationMode) -> Result<ValidationReport, TaskError> {
        let _guard = self.lock(key)?;
        let mut s = self.load_or_draft(key)?;
        if s.status.is_remote() {
            debug!(task = %key, status = %s.status, "read-only validation of a sent submission");
            let input = self.validate_input(&s)?;
            return Ok(self.engine.run(&input, mode, Utc::now()));
        }
        self.run_validation(&mut s, mode)
    }

    fn replaced_remote_id(&self, s: &EvidenceSubmission) -> Result<Option<RemoteSubmissionId>, TaskError> {
        let (RemoteIdPolicy::Reuse, Some(previous)) = (self.remote_id_policy, &s.supersedes) else {
            return Ok(None);
        };
        let archived = self
            .store
            .list_superseded(&s.key())
            .map_err(|e| TaskError::store(&s.key(), e))?;
        Ok(archived
            .into_iter()
            .find(|a| &a.local_id == previous)
            .and_then(|a| a.remote_submission_id))
    }

    /// Read every file and re-check it against the recorded checksum.
    fn prepare_uploads(&self, s: &EvidenceSubmission) -> Result<Vec<FileUpload>, TaskError> {
        let key = s.key();
        s.files
            .iter()
            .map(|f| {
                let bytes = self
                    .evidence
                    .read_file(&key, &f.filename)
                    .map_err(|e| TaskError::store(&key, e))?;
                let actual = sha256_hex(&bytes);
                match &f.checksum_sha256 {
                    Some(expected) if !expected.eq_ignore_ascii_case(&actual) => Err(TaskError::ChecksumMismatch {
                        key: key.clone(),
                        filename: f.filename.clone(),
                        detail: format!("file changed since validation: expected {expected}, found {actual}"),
                    }),
                    _ => Ok(FileUpload::new(f.filename.clone(), actual, bytes)),
                }
            })
            .collect()
    }

    /// Record `err` as the outcome of the attempt. The caller returns `err`
    /// either way; a failure to record it is logged with both causes and the
    /// record is recovered by the next holder of the lease.
    fn fail_submission(&self, s: &mut EvidenceSubmission, err: &TaskError) {
        warn!(task = %s.key(), code = err.code(), error = %err, "submission failed");
        let recorded = self.transition(s, SubmissionEvent::SubmitFailed).and_then(|()| {
            self.record(
                SubmissionHistoryEntry::for_submission(s, Utc::now()).with_notes(format!("{}: {err}", err.code())),
                &s.key(),
            )
        });
        if let Err(store_err) = &recorded {
            error!(
                task = %s.key(),
                code = err.code(),
                cause = %err,
                error = %store_err,
                "could not record failed submission"
            );
        }
    }

    /// Validate (unless bypassed), upload and create the remote submission.
    pub async fn submit(
        &self,
        key: &TaskWindow,
        opts: SubmitOptions,
        cancel: &CancelSignal,
    ) -> Result<EvidenceSubmission, TaskError> {
        let client = self.client(key)?;
        let _guard = self.lock(key)?;
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled { key: key.clone() });
        }

        let mut s = self.load_or_draft(key)?;
        if s.status == SubmissionStatus::Rejected {
            let files = s.files.clone();
            s = self.supersede(&s, files, "resubmission after rejection".into())?;
        }
        s.batch_id = opts.batch_id.clone();
        if let Some(notes) = opts.notes {
            s.notes = notes;
        }
        s.tags.extend(opts.tags);

        let bypass = opts.mode == ValidationMode::Skip;
        if bypass {
            next_status(s.status, SubmissionEvent::SubmitRequested { bypass }).map_err(|e| TaskError::transition(key, e))?;
            let report = self
                .engine
                .run(&ValidateInput::new(key, s.files.clone()), ValidationMode::Skip, Utc::now());
            self.store
                .save_validation(&report)
                .map_err(|e| TaskError::store(key, e))?;
            s.validation = Some(ValidationOutcome::from(&report));
            s.validated_at = Some(report.validated_at);
        } else {
            let report = self.run_validation(&mut s, opts.mode)?;
            if !report.ready_for_submission {
                return Err(TaskError::ValidationFailed {
                    key: key.clone(),
                    report: Box::new(report),
                });
            }
        }

        self.transition(&mut s, SubmissionEvent::SubmitRequested { bypass })?;

        let uploads = match self.prepare_uploads(&s) {
            Ok(u) => u,
            Err(e) => {
                self.fail_submission(&mut s, &e);
                return Err(e);
            }
        };
        let replaces = self.replaced_remote_id(&s)?;

        match client.submit(&s, &uploads, replaces.as_ref(), cancel).await {
            Ok(receipt) => {
                let now = Utc::now();
                s.remote_submission_id = Some(receipt.remote_id.clone());
                s.remote_response = Some(RemoteResponse {
                    submission_id: Some(receipt.remote_id),
                    outcome: Some(RemoteOutcome::Pending),
                    message: receipt.message,
                    received_at: receipt.received_at.unwrap_or(now),
                });
                s.submitted_at = Some(now);
                self.transition(&mut s, SubmissionEvent::RemoteAcknowledged)?;
                let mut entry = SubmissionHistoryEntry::for_submission(&s, now);
                if !s.notes.is_empty() {
                    entry = entry.with_notes(s.notes.clone());
                }
                self.record(entry, key)?;
                info!(
                    task = %key,
                    remote_id = ?s.remote_submission_id,
                    files = s.total_file_count,
                    bypassed = bypass,
                    "submitted"
                );
                Ok(s)
            }
            Err(e) => {
                let err = TaskError::client(key, e);
                self.fail_submission(&mut s, &err);
                Err(err)
            }
        }
    }

    /// Ask the platform for a verdict on a submitted record and apply it.
    pub async fn poll_status(&self, key: &TaskWindow) -> Result<EvidenceSubmission, TaskError> {
        let client = self.client(key)?;
        let _guard = self.lock(key)?;
        let mut s = self
            .store
            .load_submission(key)
            .map_err(|e| TaskError::store(key, e))?
            .ok_or_else(|| TaskError::NotFound { key: key.clone() })?;
        let (SubmissionStatus::Submitted, Some(id)) = (s.status, s.remote_submission_id.clone()) else {
            return Ok(s);
        };

        let outcome = client
            .check_status(&s.task_ref, &id)
            .await
            .map_err(|e| TaskError::client(key, e))?;
        let (event, note) = match &outcome {
            RemoteOutcome::Pending => {
                debug!(task = %key, remote_id = %id, "still pending review");
                return Ok(s);
            }
            RemoteOutcome::Accepted => (SubmissionEvent::RemoteAccepted, "accepted by platform".to_string()),
            RemoteOutcome::Rejected { reason } => (SubmissionEvent::RemoteRejected, format!("rejected: {reason}")),
        };

        let now = Utc::now();
        let message = match &outcome {
            RemoteOutcome::Rejected { reason } => Some(reason.clone()),
            _ => None,
        };
        s.remote_response = Some(RemoteResponse {
            submission_id: Some(id),
            outcome: Some(outcome),
            message,
            received_at: now,
        });
        s.resolved_at = Some(now);
        self.transition(&mut s, event)?;
        self.record(SubmissionHistoryEntry::for_submission(&s, now).with_notes(note), key)?;
        info!(task = %key, status = %s.status, "remote verdict recorded");
        Ok(s)
    }

    /// Explicit notification that the bundle changed.
    pub fn record_edit(&self, key: &TaskWindow) -> Result<EvidenceSubmission, TaskError> {
        let _guard = self.lock(key)?;
        let stored = self
            .store
            .load_submission(key)
            .map_err(|e| TaskError::store(key, e))?;
        match stored {
            None => self.load_or_draft(key),
            Some(s) => {
                let listing = self.list_files(key)?;
                self.apply_edit(s, listing)
            }
        }
    }

    /// Current record, last report and history. No side effects.
    pub fn status(&self, key: &TaskWindow) -> Result<StatusView, TaskError> {
        let st = |e: StoreError| TaskError::store(key, e);
        let submission = self.store.load_submission(key).map_err(st)?;
        let listing = match self.evidence.list_task_files(key) {
            Ok(files) => Some(files),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(st(e)),
        };
        if submission.is_none() && listing.is_none() {
            return Err(TaskError::NotFound { key: key.clone() });
        }
        let evidence_changed = match (&submission, &listing) {
            (Some(s), Some(files)) => s.evidence_differs(files),
            _ => false,
        };
        Ok(StatusView {
            key: key.clone(),
            validation: self.store.load_validation(key).map_err(st)?,
            history: self.store.load_history(key).map_err(st)?,
            superseded: self.store.list_superseded(key).map_err(st)?,
            submission,
            evidence_changed,
        })
    }

    /// Task/windows whose active record is `validated` for `window`.
    pub fn validated_in_window(&self, window: &Window) -> Result<Vec<TaskWindow>, StoreError> {
        Ok(self
            .store
            .list_submissions()?
            .into_iter()
            .filter(|s| &s.window == window && s.status == SubmissionStatus::Validated)
            .map(|s| s.key())
            .collect())
    }
}
