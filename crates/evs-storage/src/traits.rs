use std::collections::BTreeMap;
use std::path::PathBuf;

use evs_core::{
    BatchId, CollectionPlan, EvidenceFileRef, EvidenceSubmission, Lease, SubmissionBatch, SubmissionHistoryEntry, TaskRef,
    TaskRequirements, TaskWindow, UnresolvedFileReference, ValidationReport,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Unresolved(#[from] UnresolvedFileReference),
    #[error("invalid file name `{0}`")]
    InvalidName(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable per-task/window records plus batch manifests. No business rules.
pub trait SubmissionStore: Send + Sync {
    fn load_submission(&self, key: &TaskWindow) -> StoreResult<Option<EvidenceSubmission>>;
    fn save_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()>;
    /// Keep a copy of a record that is about to be replaced by a newer submission.
    fn archive_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()>;
    fn list_superseded(&self, key: &TaskWindow) -> StoreResult<Vec<EvidenceSubmission>>;
    /// Active submissions across all task/windows.
    fn list_submissions(&self) -> StoreResult<Vec<EvidenceSubmission>>;

    fn save_validation(&self, report: &ValidationReport) -> StoreResult<()>;
    fn load_validation(&self, key: &TaskWindow) -> StoreResult<Option<ValidationReport>>;

    fn append_history(&self, key: &TaskWindow, entry: &SubmissionHistoryEntry) -> StoreResult<()>;
    fn load_history(&self, key: &TaskWindow) -> StoreResult<Vec<SubmissionHistoryEntry>>;

    fn save_batch(&self, batch: &SubmissionBatch) -> StoreResult<()>;
    fn load_batch(&self, id: &BatchId) -> StoreResult<Option<SubmissionBatch>>;
    /// Newest first.
    fn list_batches(&self) -> StoreResult<Vec<SubmissionBatch>>;

    /// Claim `key` for `ttl_secs`. Returns `None` while another unexpired lease exists,
    /// whoever holds it. Visible to every process sharing the store.
    fn try_acquire_lease(&self, key: &TaskWindow, owner: &str, ttl_secs: i64) -> StoreResult<Option<Lease>>;
    /// Drops `lease` if it is still the current one for its key.
    fn release_lease(&self, lease: &Lease) -> StoreResult<()>;
}

/// Read side of the local evidence storage layer.
pub trait EvidenceSource: Send + Sync {
    /// Fails with [`StoreError::NotFound`] when no evidence exists for the task/window.
    fn list_task_files(&self, key: &TaskWindow) -> StoreResult<Vec<EvidenceFileRef>>;
    fn read_file(&self, key: &TaskWindow, filename: &str) -> StoreResult<Vec<u8>>;
    fn collection_plan(&self, key: &TaskWindow) -> StoreResult<Option<CollectionPlan>>;
}

/// Which controls each task must cover. Supplied as input, never derived.
pub trait TaskCatalog: Send + Sync {
    fn required_controls(&self, task: &TaskRef) -> Vec<String>;
}

impl TaskCatalog for BTreeMap<String, TaskRequirements> {
    fn required_controls(&self, task: &TaskRef) -> Vec<String> {
        self.get(task.as_str())
            .map(|t| t.required_controls.clone())
            .unwrap_or_default()
    }
}
