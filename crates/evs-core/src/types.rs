use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{checksum, ids::*, model::*};

/// One file belonging to a submission. Recomputed whenever the file changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceFileRef {
    pub filename: String,
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls_satisfied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl EvidenceFileRef {
    pub fn named(filename: impl Into<String>) -> Self {
        let filename = filename.into();
        Self {
            title: filename.clone(),
            relative_path: filename.clone(),
            filename,
            ..Default::default()
        }
    }

    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// Upstream generation metadata may name a file by filename only or carry a
/// full record. Resolved once by [`resolve_file_entries`]; nothing past the
/// storage boundary sees this type.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum EvidenceFileEntry {
    Reference(String),
    FullRecord(EvidenceFileRef),
}

impl EvidenceFileEntry {
    pub fn filename(&self) -> &str {
        match self {
            EvidenceFileEntry::Reference(name) => name,
            EvidenceFileEntry::FullRecord(rec) => &rec.filename,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("generation metadata references `{0}` but no such file exists in the bundle")]
pub struct UnresolvedFileReference(pub String);

/// Merge declared metadata into the scanned file list.
///
/// Size, checksum and timestamp always come from the scan. Declared title,
/// source and controls override the scanned defaults. Bare references take
/// `default_source`.
pub fn resolve_file_entries(
    scanned: Vec<EvidenceFileRef>,
    entries: Vec<EvidenceFileEntry>,
    default_source: Option<&str>,
) -> Result<Vec<EvidenceFileRef>, UnresolvedFileReference> {
    let mut by_name: HashMap<String, EvidenceFileRef> =
        scanned.into_iter().map(|f| (f.filename.clone(), f)).collect();

    for entry in entries {
        let file = by_name
            .get_mut(entry.filename())
            .ok_or_else(|| UnresolvedFileReference(entry.filename().to_string()))?;
        match entry {
            EvidenceFileEntry::Reference(_) => {
                if file.source.is_none() {
                    file.source = default_source.map(str::to_string);
                }
            }
            EvidenceFileEntry::FullRecord(rec) => {
                if !rec.title.is_empty() {
                    file.title = rec.title;
                }
                if rec.source.is_some() {
                    file.source = rec.source;
                } else if file.source.is_none() {
                    file.source = default_source.map(str::to_string);
                }
                if !rec.controls_satisfied.is_empty() {
                    file.controls_satisfied = rec.controls_satisfied;
                }
            }
        }
    }

    let mut files: Vec<EvidenceFileRef> = by_name.into_values().collect();
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

/// A single rule failure or warning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleCheck {
    pub code: String,
    pub name: String,
    pub status: RuleStatus,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub task_ref: TaskRef,
    pub window: Window,
    pub mode: ValidationMode,
    pub status: ReportStatus,
    pub completeness_score: f64,
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,
    pub warnings: usize,
    pub checks: Vec<RuleCheck>,
    pub findings: Vec<ValidationError>,
    pub ready_for_submission: bool,
    /// Validation was skipped on request.
    pub bypassed: bool,
    pub fileset_checksum: String,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn key(&self) -> TaskWindow {
        TaskWindow {
            task_ref: self.task_ref.clone(),
            window: self.window.clone(),
        }
    }

    pub fn findings_with(&self, severity: Severity) -> impl Iterator<Item = &ValidationError> {
        self.findings.iter().filter(move |f| f.severity == severity)
    }
}

/// Validation result as carried on the submission record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationOutcome {
    pub status: ReportStatus,
    pub mode: ValidationMode,
    pub score: f64,
    pub ready_for_submission: bool,
    pub bypassed: bool,
    pub fileset_checksum: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
    pub validated_at: DateTime<Utc>,
}

impl From<&ValidationReport> for ValidationOutcome {
    fn from(r: &ValidationReport) -> Self {
        Self {
            status: r.status,
            mode: r.mode,
            score: r.completeness_score,
            ready_for_submission: r.ready_for_submission,
            bypassed: r.bypassed,
            fileset_checksum: r.fileset_checksum.clone(),
            errors: r.findings.clone(),
            validated_at: r.validated_at,
        }
    }
}

/// Snapshot of the last remote exchange.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<RemoteSubmissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RemoteOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// The unit of work for one task within one collection window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EvidenceSubmission {
    pub local_id: LocalSubmissionId,
    pub task_ref: TaskRef,
    pub window: Window,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_submission_id: Option<RemoteSubmissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    /// Local id of the submission this one replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<LocalSubmissionId>,
    pub files: Vec<EvidenceFileRef>,
    pub total_file_count: usize,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub submitted_by: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_response: Option<RemoteResponse>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EvidenceSubmission {
    pub fn draft(
        key: &TaskWindow,
        files: Vec<EvidenceFileRef>,
        submitted_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut s = Self {
            local_id: LocalSubmissionId::generate(),
            task_ref: key.task_ref.clone(),
            window: key.window.clone(),
            status: SubmissionStatus::Draft,
            remote_submission_id: None,
            batch_id: None,
            supersedes: None,
            files: vec![],
            total_file_count: 0,
            total_size_bytes: 0,
            submitted_by: submitted_by.into(),
            notes: String::new(),
            tags: BTreeSet::new(),
            validation: None,
            remote_response: None,
            created_at: now,
            validated_at: None,
            submitted_at: None,
            resolved_at: None,
        };
        s.replace_files(files);
        s
    }

    /// New draft that replaces `previous`. The previous record is left untouched.
    pub fn superseding(previous: &EvidenceSubmission, files: Vec<EvidenceFileRef>, now: DateTime<Utc>) -> Self {
        let mut s = Self::draft(&previous.key(), files, previous.submitted_by.clone(), now);
        s.supersedes = Some(previous.local_id.clone());
        s.notes = previous.notes.clone();
        s.tags = previous.tags.clone();
        s
    }

    pub fn key(&self) -> TaskWindow {
        TaskWindow {
            task_ref: self.task_ref.clone(),
            window: self.window.clone(),
        }
    }

    pub fn replace_files(&mut self, mut files: Vec<EvidenceFileRef>) {
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        self.total_file_count = files.len();
        self.total_size_bytes = files.iter().map(|f| f.size_bytes).sum();
        self.files = files;
    }

    pub fn fileset_checksum(&self) -> String {
        checksum::fileset_checksum(&self.files)
    }

    /// True when `listing` differs from the recorded files in content or declared metadata.
    pub fn evidence_differs(&self, listing: &[EvidenceFileRef]) -> bool {
        checksum::evidence_fingerprint(listing) != checksum::evidence_fingerprint(&self.files)
    }

    /// Token for the create-submission call. A superseding record mixes in the
    /// id it replaces, so resubmitting identical files is not folded into the
    /// rejected record.
    pub fn idempotency_token(&self) -> String {
        let fileset = self.fileset_checksum();
        match &self.supersedes {
            None => checksum::idempotency_token(&self.key(), &fileset),
            Some(previous) => checksum::idempotency_token(&self.key(), &format!("{fileset}:{previous}")),
        }
    }

    /// Union of controls the bundle claims to satisfy, sorted.
    pub fn controls_covered(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .files
            .iter()
            .flat_map(|f| f.controls_satisfied.iter().map(String::as_str))
            .collect();
        set.into_iter().map(str::to_string).collect()
    }
}

/// Append-only audit record per task/window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionHistoryEntry {
    pub local_id: LocalSubmissionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<RemoteSubmissionId>,
    pub recorded_at: DateTime<Utc>,
    pub submitted_by: String,
    pub status: SubmissionStatus,
    pub file_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub validation_bypassed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<LocalSubmissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SubmissionHistoryEntry {
    pub fn for_submission(s: &EvidenceSubmission, now: DateTime<Utc>) -> Self {
        Self {
            local_id: s.local_id.clone(),
            submission_id: s.remote_submission_id.clone(),
            recorded_at: now,
            submitted_by: s.submitted_by.clone(),
            status: s.status,
            file_count: s.total_file_count,
            batch_id: s.batch_id.clone(),
            validation_bypassed: s.validation.as_ref().map(|v| v.bypassed).unwrap_or(false),
            supersedes: s.supersedes.clone(),
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSubmissionResult {
    pub task_ref: TaskRef,
    pub window: Window,
    pub status: BatchTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<RemoteSubmissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchSubmissionResult {
    pub fn pending(key: &TaskWindow) -> Self {
        Self {
            task_ref: key.task_ref.clone(),
            window: key.window.clone(),
            status: BatchTaskStatus::Pending,
            submission_id: None,
            error_code: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn key(&self) -> TaskWindow {
        TaskWindow {
            task_ref: self.task_ref.clone(),
            window: self.window.clone(),
        }
    }
}

/// A named group of task submissions processed together.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubmissionBatch {
    pub batch_id: BatchId,
    pub name: String,
    pub status: BatchStatus,
    pub tasks: Vec<TaskWindow>,
    pub total_tasks: usize,
    pub submitted_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub validation_mode: ValidationMode,
    pub continue_on_error: bool,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Vec<BatchSubmissionResult>,
}

impl SubmissionBatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        batch_id: BatchId,
        name: impl Into<String>,
        tasks: Vec<TaskWindow>,
        validation_mode: ValidationMode,
        continue_on_error: bool,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let results = tasks.iter().map(BatchSubmissionResult::pending).collect();
        let mut b = Self {
            batch_id,
            name: name.into(),
            status: BatchStatus::Pending,
            total_tasks: tasks.len(),
            tasks,
            submitted_tasks: 0,
            failed_tasks: 0,
            skipped_tasks: 0,
            validation_mode,
            continue_on_error,
            created_by: created_by.into(),
            created_at: now,
            started_at: None,
            completed_at: None,
            results,
        };
        b.recount();
        b
    }

    pub fn result_mut(&mut self, key: &TaskWindow) -> Option<&mut BatchSubmissionResult> {
        self.results
            .iter_mut()
            .find(|r| r.task_ref == key.task_ref && r.window == key.window)
    }

    pub fn recount(&mut self) {
        self.total_tasks = self.results.len();
        self.submitted_tasks = self.count(BatchTaskStatus::Success);
        self.failed_tasks = self.count(BatchTaskStatus::Failed);
        self.skipped_tasks = self.count(BatchTaskStatus::Skipped);
    }

    pub fn count(&self, status: BatchTaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Exclusive claim on one task/window, shared by every process using the same store.
/// A lease past `expires_at` belongs to nobody and may be taken over.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub key: TaskWindow,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(key: TaskWindow, owner: impl Into<String>, now: DateTime<Utc>, ttl_secs: i64) -> Self {
        let expires_at = chrono::Duration::try_seconds(ttl_secs)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: LeaseId::generate(),
            key,
            owner: owner.into(),
            acquired_at: now,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Control-framework mapping supplied as input for one task.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRequirements {
    #[serde(default)]
    pub required_controls: Vec<String>,
}

/// Collection-plan summary written by the evidence generator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CollectionPlan {
    /// 0.0..=1.0
    pub completeness: f64,
}
