#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use evs_client::{
    CreateSubmissionRequest, CreateSubmissionResponse, FileUpload, PlatformTransport, RetryPolicy, SubmissionClient,
    SubmissionStatusResponse, TransportFailure, UploadedFile,
};
use evs_core::{
    BatchId, EvidenceFileRef, EvidenceSubmission, Lease, RemoteIdPolicy, RemoteSubmissionId, SubmissionBatch,
    SubmissionHistoryEntry, SubmissionStatus, TaskRef, TaskRequirements, TaskWindow, ValidationReport,
};
use evs_runner::TaskController;
use evs_storage::{InMemoryEvidence, InMemoryStore, StoreError, StoreResult, SubmissionStore};
use evs_validate::{ValidationConfig, ValidationEngine};

/// Scripted remote platform.
#[derive(Default)]
pub struct FakePlatform {
    pub uploads: AtomicUsize,
    pub creates: AtomicUsize,
    /// Uploads of these `<task>/<filename>` pairs always come back with a different digest.
    pub corrupt: Mutex<HashSet<String>>,
    pub reject_with: Mutex<Option<String>>,
    pub create_delay: Mutex<Option<Duration>>,
    pub verdicts: Mutex<HashMap<String, (String, Option<String>)>>,
    pub records: Mutex<HashMap<String, String>>,
    pub requests: Mutex<Vec<CreateSubmissionRequest>>,
}

impl FakePlatform {
    pub fn corrupt(&self, task: &str, filename: &str) {
        self.corrupt.lock().unwrap().insert(format!("{task}/{filename}"));
    }

    pub fn heal(&self) {
        self.corrupt.lock().unwrap().clear();
    }

    pub fn verdict(&self, id: &RemoteSubmissionId, status: &str, notes: Option<&str>) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(id.to_string(), (status.to_string(), notes.map(str::to_string)));
    }

    pub fn last_request(&self) -> CreateSubmissionRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl PlatformTransport for FakePlatform {
    async fn upload_file(&self, task: &TaskRef, file: &FileUpload) -> Result<UploadedFile, TransportFailure> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.corrupt.lock().unwrap().contains(&format!("{task}/{}", file.filename)) {
            return Err(TransportFailure::ChecksumMismatch(format!(
                "content digest differs for {}",
                file.filename
            )));
        }
        Ok(UploadedFile {
            file_id: format!("file-{n}"),
            filename: file.filename.clone(),
            size: file.bytes.len() as u64,
            checksum_sha256: file.checksum_sha256.clone(),
        })
    }

    async fn create_submission(
        &self,
        task: &TaskRef,
        idempotency_key: &str,
        request: &CreateSubmissionRequest,
    ) -> Result<CreateSubmissionResponse, TransportFailure> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.reject_with.lock().unwrap().clone() {
            return Err(TransportFailure::Rejected { status: 422, reason });
        }
        self.requests.lock().unwrap().push(request.clone());
        let id = {
            let mut records = self.records.lock().unwrap();
            let next = format!("sub-{task}-{}", records.len() + 1);
            records.entry(idempotency_key.to_string()).or_insert(next).clone()
        };
        Ok(CreateSubmissionResponse {
            submission_id: id,
            status: "pending_review".into(),
            message: None,
            received_at: None,
        })
    }

    async fn get_submission(
        &self,
        _task: &TaskRef,
        id: &RemoteSubmissionId,
    ) -> Result<SubmissionStatusResponse, TransportFailure> {
        let (status, review_notes) = self
            .verdicts
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .unwrap_or_else(|| ("pending_review".into(), None));
        Ok(SubmissionStatusResponse {
            submission_id: id.to_string(),
            status,
            review_notes,
        })
    }
}

/// Wraps an [`InMemoryStore`] and fails selected writes.
pub struct FailingStore {
    pub inner: Arc<InMemoryStore>,
    /// 1-based index of the `save_batch` call that fails; later calls succeed.
    pub fail_batch_save_at: Option<usize>,
    /// Saving a submission with this status fails.
    pub fail_status_save: Option<SubmissionStatus>,
    pub batch_saves: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_batch_save_at: None,
            fail_status_save: None,
            batch_saves: AtomicUsize::new(0),
        }
    }
}

impl SubmissionStore for FailingStore {
    fn load_submission(&self, key: &TaskWindow) -> StoreResult<Option<EvidenceSubmission>> {
        self.inner.load_submission(key)
    }

    fn save_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()> {
        if self.fail_status_save == Some(submission.status) {
            return Err(StoreError::Poisoned);
        }
        self.inner.save_submission(submission)
    }

    fn archive_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()> {
        self.inner.archive_submission(submission)
    }

    fn list_superseded(&self, key: &TaskWindow) -> StoreResult<Vec<EvidenceSubmission>> {
        self.inner.list_superseded(key)
    }

    fn list_submissions(&self) -> StoreResult<Vec<EvidenceSubmission>> {
        self.inner.list_submissions()
    }

    fn save_validation(&self, report: &ValidationReport) -> StoreResult<()> {
        self.inner.save_validation(report)
    }

    fn load_validation(&self, key: &TaskWindow) -> StoreResult<Option<ValidationReport>> {
        self.inner.load_validation(key)
    }

    fn append_history(&self, key: &TaskWindow, entry: &SubmissionHistoryEntry) -> StoreResult<()> {
        self.inner.append_history(key, entry)
    }

    fn load_history(&self, key: &TaskWindow) -> StoreResult<Vec<SubmissionHistoryEntry>> {
        self.inner.load_history(key)
    }

    fn save_batch(&self, batch: &SubmissionBatch) -> StoreResult<()> {
        let n = self.batch_saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_batch_save_at == Some(n) {
            return Err(StoreError::Poisoned);
        }
        self.inner.save_batch(batch)
    }

    fn load_batch(&self, id: &BatchId) -> StoreResult<Option<SubmissionBatch>> {
        self.inner.load_batch(id)
    }

    fn list_batches(&self) -> StoreResult<Vec<SubmissionBatch>> {
        self.inner.list_batches()
    }

    fn try_acquire_lease(&self, key: &TaskWindow, owner: &str, ttl_secs: i64) -> StoreResult<Option<Lease>> {
        self.inner.try_acquire_lease(key, owner, ttl_secs)
    }

    fn release_lease(&self, lease: &Lease) -> StoreResult<()> {
        self.inner.release_lease(lease)
    }
}

pub fn key(task: &str) -> TaskWindow {
    TaskWindow::new(task, "2025-Q4")
}

pub fn file(name: &str, controls: &[&str]) -> EvidenceFileRef {
    EvidenceFileRef {
        source: Some("terraform-scanner".into()),
        controls_satisfied: controls.iter().map(|c| c.to_string()).collect(),
        modified_at: Some(Utc.with_ymd_and_hms(2025, 11, 14, 10, 0, 0).unwrap()),
        ..EvidenceFileRef::named(name)
    }
}

/// Three clean files covering CC6.1 and CC6.2.
pub fn seed(evidence: &InMemoryEvidence, key: &TaskWindow) {
    evidence
        .put_file(key, file("01_roles.md", &["CC6.1"]), "# IAM roles\n\nAll roles reviewed.\n")
        .unwrap();
    evidence
        .put_file(key, file("02_users.csv", &["CC6.2"]), "user,role\nalice,admin\nbob,viewer\n")
        .unwrap();
    evidence
        .put_file(key, file("03_policy.json", &["CC6.1"]), "{\"mfa\": true}")
        .unwrap();
}

pub struct Harness {
    pub controller: Arc<TaskController>,
    pub store: Arc<InMemoryStore>,
    pub evidence: Arc<InMemoryEvidence>,
    pub platform: Arc<FakePlatform>,
}

fn catalog() -> BTreeMap<String, TaskRequirements> {
    let mut tasks = BTreeMap::new();
    for task in ["ET-0001", "ET-0002", "ET-0003", "ET-0004"] {
        tasks.insert(
            task.to_string(),
            TaskRequirements {
                required_controls: vec!["CC6.1".into(), "CC6.2".into()],
            },
        );
    }
    tasks.insert(
        "ET-0103".to_string(),
        TaskRequirements {
            required_controls: vec!["CC6.1".into(), "CC7.2".into()],
        },
    );
    tasks
}

/// A controller over the given store, evidence and platform.
pub fn controller_over(
    store: Arc<dyn SubmissionStore>,
    evidence: Arc<InMemoryEvidence>,
    platform: Arc<FakePlatform>,
    submitted_by: &str,
    policy: RemoteIdPolicy,
    with_client: bool,
) -> TaskController {
    let engine = ValidationEngine::from_config(&ValidationConfig::default()).unwrap();
    let mut controller = TaskController::new(store, evidence, Arc::new(catalog()), Arc::new(engine), submitted_by)
        .with_remote_id_policy(policy);
    if with_client {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        };
        let transport: Arc<dyn PlatformTransport> = platform;
        controller = controller.with_client(SubmissionClient::new(transport, retry, Duration::from_secs(5)));
    }
    controller
}

pub fn controller_parts(policy: RemoteIdPolicy, with_client: bool) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let evidence = Arc::new(InMemoryEvidence::new());
    let platform = Arc::new(FakePlatform::default());
    let controller = controller_over(store.clone(), evidence.clone(), platform.clone(), "alice", policy, with_client);
    Harness {
        controller: Arc::new(controller),
        store,
        evidence,
        platform,
    }
}

/// Same layout as [`harness`], with the controller writing through `wrap(store)`.
pub fn harness_with(wrap: impl FnOnce(Arc<InMemoryStore>) -> FailingStore) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let evidence = Arc::new(InMemoryEvidence::new());
    let platform = Arc::new(FakePlatform::default());
    let failing: Arc<dyn SubmissionStore> = Arc::new(wrap(store.clone()));
    let controller = controller_over(
        failing,
        evidence.clone(),
        platform.clone(),
        "alice",
        RemoteIdPolicy::MintNew,
        true,
    );
    Harness {
        controller: Arc::new(controller),
        store,
        evidence,
        platform,
    }
}

/// Polls until the platform has seen `n` create calls.
pub async fn wait_for_creates(platform: &FakePlatform, n: usize) {
    for _ in 0..400 {
        if platform.creates.load(Ordering::SeqCst) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("platform never saw {n} create calls");
}

pub fn harness() -> Harness {
    controller_parts(RemoteIdPolicy::MintNew, true)
}
