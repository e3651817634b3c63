use evs_client::ClientError;
use evs_core::{BatchId, Severity, SubmissionBatch, TaskWindow, TransitionError, ValidationReport};
use evs_storage::StoreError;

/// Failure of one task operation, always attributed to its task/window.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{key}: validation blocked submission ({} blocking finding(s))", blocking_count(report))]
    ValidationFailed {
        key: TaskWindow,
        report: Box<ValidationReport>,
    },
    #[error("{key}: transport failure: {message}")]
    Transport { key: TaskWindow, message: String },
    #[error("{key}: remote rejection: {reason}")]
    RemoteRejection { key: TaskWindow, reason: String },
    #[error("{key}: submission in progress")]
    InProgress { key: TaskWindow },
    #[error("{key}: checksum mismatch on {filename}: {detail}")]
    ChecksumMismatch {
        key: TaskWindow,
        filename: String,
        detail: String,
    },
    #[error("{key}: configuration error: {message}")]
    Configuration { key: TaskWindow, message: String },
    #[error("{key}: no evidence found")]
    NotFound { key: TaskWindow },
    #[error("{key}: platform refused credentials ({status})")]
    Authentication { key: TaskWindow, status: u16 },
    #[error("{key}: {source}")]
    InvalidTransition {
        key: TaskWindow,
        #[source]
        source: TransitionError,
    },
    #[error("{key}: store error: {source}")]
    Store {
        key: TaskWindow,
        #[source]
        source: StoreError,
    },
    #[error("{key}: cancelled")]
    Cancelled { key: TaskWindow },
}

fn blocking_count(report: &ValidationReport) -> usize {
    match report.mode {
        evs_core::ValidationMode::Strict => report.failed_checks + report.warnings,
        _ => report.failed_checks,
    }
}

impl TaskError {
    pub fn key(&self) -> &TaskWindow {
        match self {
            TaskError::ValidationFailed { key, .. }
            | TaskError::Transport { key, .. }
            | TaskError::RemoteRejection { key, .. }
            | TaskError::InProgress { key }
            | TaskError::ChecksumMismatch { key, .. }
            | TaskError::Configuration { key, .. }
            | TaskError::NotFound { key }
            | TaskError::Authentication { key, .. }
            | TaskError::InvalidTransition { key, .. }
            | TaskError::Store { key, .. }
            | TaskError::Cancelled { key } => key,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TaskError::ValidationFailed { .. } => "VALIDATION_FAILED",
            TaskError::Transport { .. } => "TRANSPORT",
            TaskError::RemoteRejection { .. } => "REMOTE_REJECTION",
            TaskError::InProgress { .. } => "SUBMISSION_IN_PROGRESS",
            TaskError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            TaskError::Configuration { .. } => "CONFIGURATION",
            TaskError::NotFound { .. } => "TASK_NOT_FOUND",
            TaskError::Authentication { .. } => "AUTHENTICATION",
            TaskError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TaskError::Store { .. } => "STORE",
            TaskError::Cancelled { .. } => "CANCELLED",
        }
    }

    /// What the operator should do next, when there is something specific.
    pub fn remediation(&self) -> Option<String> {
        match self {
            TaskError::ValidationFailed { report, .. } => {
                let mut hints: Vec<String> = report
                    .findings
                    .iter()
                    .filter(|f| f.severity != Severity::Info)
                    .map(|f| match &f.suggestion {
                        Some(s) => format!("{}: {}", f.code, s),
                        None => format!("{}: {}", f.code, f.message),
                    })
                    .collect();
                hints.dedup();
                Some(hints.join("; ")).filter(|s| !s.is_empty())
            }
            TaskError::Transport { .. } => Some("check connectivity and retry the submission".into()),
            TaskError::RemoteRejection { .. } => {
                Some("address the platform's reason, edit the evidence and resubmit".into())
            }
            TaskError::InProgress { .. } => Some("wait for the running submission to finish".into()),
            TaskError::ChecksumMismatch { .. } => {
                Some("the file changed or was corrupted in transit; re-validate and resubmit".into())
            }
            TaskError::Configuration { .. } => Some("fix .evs/evs.toml or the environment".into()),
            TaskError::NotFound { .. } => Some("collect evidence for this task and window first".into()),
            TaskError::Authentication { .. } => Some("refresh the bearer token".into()),
            TaskError::InvalidTransition { .. } => Some("run `evs status` to see the current state".into()),
            TaskError::Store { .. } | TaskError::Cancelled { .. } => None,
        }
    }

    pub(crate) fn store(key: &TaskWindow, source: StoreError) -> Self {
        match source {
            StoreError::NotFound(_) => TaskError::NotFound { key: key.clone() },
            source => TaskError::Store {
                key: key.clone(),
                source,
            },
        }
    }

    pub(crate) fn transition(key: &TaskWindow, source: TransitionError) -> Self {
        TaskError::InvalidTransition {
            key: key.clone(),
            source,
        }
    }

    pub(crate) fn client(key: &TaskWindow, err: ClientError) -> Self {
        let key = key.clone();
        match err {
            ClientError::Integrity { filename, detail } => TaskError::ChecksumMismatch { key, filename, detail },
            ClientError::Rejected { reason, .. } => TaskError::RemoteRejection { key, reason },
            ClientError::Authentication { status } => TaskError::Authentication { key, status },
            ClientError::Cancelled(_) => TaskError::Cancelled { key },
            err @ ClientError::Transport { .. } => TaskError::Transport {
                key,
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch store error: {0}")]
    Store(#[from] StoreError),
    #[error("batch {0} not found")]
    NotFound(BatchId),
    #[error("batch selection matched no tasks")]
    Empty,
    #[error("invalid batch: {0}")]
    Invalid(String),
    /// Every dispatched task ran to completion but the manifest could not be
    /// written. `batch` is the full per-task ledger as it stood at the end.
    #[error("batch {} finished but its manifest could not be written: {source}", batch.batch_id)]
    Persistence {
        batch: Box<SubmissionBatch>,
        #[source]
        source: StoreError,
    },
}
