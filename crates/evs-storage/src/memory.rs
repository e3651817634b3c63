use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use evs_core::{
    sha256_hex, BatchId, CollectionPlan, EvidenceFileRef, EvidenceSubmission, Lease, SubmissionBatch,
    SubmissionHistoryEntry, TaskWindow, ValidationReport,
};

use crate::traits::{EvidenceSource, StoreError, StoreResult, SubmissionStore};

fn lock<T>(m: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    m.lock().map_err(|_| StoreError::Poisoned)
}

/// In-memory submission store for tests. Not durable.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    submissions: HashMap<TaskWindow, EvidenceSubmission>,
    superseded: HashMap<TaskWindow, Vec<EvidenceSubmission>>,
    validations: HashMap<TaskWindow, ValidationReport>,
    history: HashMap<TaskWindow, Vec<SubmissionHistoryEntry>>,
    batches: HashMap<BatchId, SubmissionBatch>,
    leases: HashMap<TaskWindow, Lease>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubmissionStore for InMemoryStore {
    fn load_submission(&self, key: &TaskWindow) -> StoreResult<Option<EvidenceSubmission>> {
        Ok(lock(&self.inner)?.submissions.get(key).cloned())
    }

    fn save_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()> {
        lock(&self.inner)?
            .submissions
            .insert(submission.key(), submission.clone());
        Ok(())
    }

    fn archive_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()> {
        lock(&self.inner)?
            .superseded
            .entry(submission.key())
            .or_default()
            .push(submission.clone());
        Ok(())
    }

    fn list_superseded(&self, key: &TaskWindow) -> StoreResult<Vec<EvidenceSubmission>> {
        Ok(lock(&self.inner)?.superseded.get(key).cloned().unwrap_or_default())
    }

    fn list_submissions(&self) -> StoreResult<Vec<EvidenceSubmission>> {
        let inner = lock(&self.inner)?;
        let mut all: Vec<_> = inner.submissions.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(all)
    }

    fn save_validation(&self, report: &ValidationReport) -> StoreResult<()> {
        lock(&self.inner)?.validations.insert(report.key(), report.clone());
        Ok(())
    }

    fn load_validation(&self, key: &TaskWindow) -> StoreResult<Option<ValidationReport>> {
        Ok(lock(&self.inner)?.validations.get(key).cloned())
    }

    fn append_history(&self, key: &TaskWindow, entry: &SubmissionHistoryEntry) -> StoreResult<()> {
        lock(&self.inner)?
            .history
            .entry(key.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn load_history(&self, key: &TaskWindow) -> StoreResult<Vec<SubmissionHistoryEntry>> {
        Ok(lock(&self.inner)?.history.get(key).cloned().unwrap_or_default())
    }

    fn save_batch(&self, batch: &SubmissionBatch) -> StoreResult<()> {
        lock(&self.inner)?
            .batches
            .insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    fn load_batch(&self, id: &BatchId) -> StoreResult<Option<SubmissionBatch>> {
        Ok(lock(&self.inner)?.batches.get(id).cloned())
    }

    fn list_batches(&self) -> StoreResult<Vec<SubmissionBatch>> {
        let inner = lock(&self.inner)?;
        let mut all: Vec<_> = inner.batches.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.batch_id.cmp(&a.batch_id)));
        Ok(all)
    }

    fn try_acquire_lease(&self, key: &TaskWindow, owner: &str, ttl_secs: i64) -> StoreResult<Option<Lease>> {
        let mut inner = lock(&self.inner)?;
        let now = Utc::now();
        if inner.leases.get(key).is_some_and(|held| !held.is_expired(now)) {
            return Ok(None);
        }
        let lease = Lease::new(key.clone(), owner, now, ttl_secs);
        inner.leases.insert(key.clone(), lease.clone());
        Ok(Some(lease))
    }

    fn release_lease(&self, lease: &Lease) -> StoreResult<()> {
        let mut inner = lock(&self.inner)?;
        if inner.leases.get(&lease.key).is_some_and(|held| held.id == lease.id) {
            inner.leases.remove(&lease.key);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Bundle {
    files: BTreeMap<String, (EvidenceFileRef, Vec<u8>)>,
    plan: Option<CollectionPlan>,
}

/// In-memory evidence listing for tests. Checksums are computed on insert.
#[derive(Default)]
pub struct InMemoryEvidence {
    bundles: Mutex<HashMap<TaskWindow, Bundle>>,
}

impl InMemoryEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file. `template` supplies title, source and controls.
    pub fn put_file(&self, key: &TaskWindow, template: EvidenceFileRef, bytes: impl Into<Vec<u8>>) -> StoreResult<()> {
        let bytes = bytes.into();
        let file = EvidenceFileRef {
            size_bytes: bytes.len() as u64,
            checksum_sha256: Some(sha256_hex(&bytes)),
            modified_at: template.modified_at.or_else(|| Some(Utc::now())),
            ..template
        };
        lock(&self.bundles)?
            .entry(key.clone())
            .or_default()
            .files
            .insert(file.filename.clone(), (file, bytes));
        Ok(())
    }

    pub fn remove_file(&self, key: &TaskWindow, filename: &str) -> StoreResult<()> {
        if let Some(b) = lock(&self.bundles)?.get_mut(key) {
            b.files.remove(filename);
        }
        Ok(())
    }

    pub fn set_plan(&self, key: &TaskWindow, plan: CollectionPlan) -> StoreResult<()> {
        lock(&self.bundles)?.entry(key.clone()).or_default().plan = Some(plan);
        Ok(())
    }
}

impl EvidenceSource for InMemoryEvidence {
    fn list_task_files(&self, key: &TaskWindow) -> StoreResult<Vec<EvidenceFileRef>> {
        let bundles = lock(&self.bundles)?;
        let bundle = bundles
            .get(key)
            .ok_or_else(|| StoreError::NotFound(format!("evidence for {key}")))?;
        Ok(bundle.files.values().map(|(f, _)| f.clone()).collect())
    }

    fn read_file(&self, key: &TaskWindow, filename: &str) -> StoreResult<Vec<u8>> {
        lock(&self.bundles)?
            .get(key)
            .and_then(|b| b.files.get(filename))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(format!("{filename} in {key}")))
    }

    fn collection_plan(&self, key: &TaskWindow) -> StoreResult<Option<CollectionPlan>> {
        Ok(lock(&self.bundles)?.get(key).and_then(|b| b.plan.clone()))
    }
}
