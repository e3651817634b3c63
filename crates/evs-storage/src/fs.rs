use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use evs_core::{
    resolve_file_entries, sha256_reader, BatchId, CollectionPlan, EvidenceFileEntry, EvidenceFileRef,
    EvidenceSubmission, Lease, SubmissionBatch, SubmissionHistoryEntry, TaskWindow, ValidationReport,
};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::traits::{EvidenceSource, StoreError, StoreResult, SubmissionStore};

const META_DIR: &str = ".submission";
const PLAN_FILE: &str = "collection_plan_metadata.yaml";
const GENERATION_METADATA: &str = ".generation/metadata.yaml";
const LEASE_FILE: &str = "lease.yaml";
const LEASE_LOCK: &str = "lease.lock";

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_yaml::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// Write via a sibling temp file and rename so readers never see a torn record.
fn write_yaml<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let text = serde_yaml::to_string(value).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, text).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    Ok(())
}

fn window_dir(root: &Path, key: &TaskWindow) -> PathBuf {
    root.join("evidence").join(key.task_ref.as_str()).join(key.window.as_str())
}

fn subdirs(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(io_err(dir)(e)),
    };
    let mut out = vec![];
    for entry in rd {
        let entry = entry.map_err(io_err(dir))?;
        if entry.file_type().map_err(io_err(dir))?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// YAML files under `<data_dir>`:
///
/// ```text
/// evidence/<task>/<window>/.submission/submission.yaml
/// evidence/<task>/<window>/.submission/validation.yaml
/// evidence/<task>/<window>/.submission/history.yaml
/// evidence/<task>/<window>/.submission/superseded/<local-id>.yaml
/// submissions/<batch-id>/manifest.yaml
/// leases/<task>/<window>/lease.yaml
/// ```
///
/// `lease.yaml` is read and rewritten only while holding an exclusive OS lock
/// on the sibling `lease.lock`, so separate processes see one owner at a time.
/// Leases live outside `evidence/` so claiming an unknown task creates nothing there.
#[derive(Clone, Debug)]
pub struct FsSubmissionStore {
    pub root: PathBuf,
}

impl FsSubmissionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn meta_dir(&self, key: &TaskWindow) -> PathBuf {
        window_dir(&self.root, key).join(META_DIR)
    }

    fn batch_manifest(&self, id: &BatchId) -> PathBuf {
        self.root.join("submissions").join(id.as_str()).join("manifest.yaml")
    }

    /// Run `f` on the lease file path under the per-task/window OS lock.
    fn with_lease_lock<T>(&self, key: &TaskWindow, f: impl FnOnce(&Path) -> StoreResult<T>) -> StoreResult<T> {
        let dir = self
            .root
            .join("leases")
            .join(key.task_ref.as_str())
            .join(key.window.as_str());
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let lock_path = dir.join(LEASE_LOCK);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        FileExt::lock_exclusive(&lock).map_err(io_err(&lock_path))?;
        // Released when `lock` is closed.
        f(&dir.join(LEASE_FILE))
    }
}

impl SubmissionStore for FsSubmissionStore {
    fn load_submission(&self, key: &TaskWindow) -> StoreResult<Option<EvidenceSubmission>> {
        read_yaml(&self.meta_dir(key).join("submission.yaml"))
    }

    fn save_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()> {
        let path = self.meta_dir(&submission.key()).join("submission.yaml");
        debug!(path = %path.display(), status = %submission.status, "saving submission");
        write_yaml(&path, submission)
    }

    fn archive_submission(&self, submission: &EvidenceSubmission) -> StoreResult<()> {
        let path = self
            .meta_dir(&submission.key())
            .join("superseded")
            .join(format!("{}.yaml", submission.local_id));
        write_yaml(&path, submission)
    }

    fn list_superseded(&self, key: &TaskWindow) -> StoreResult<Vec<EvidenceSubmission>> {
        let dir = self.meta_dir(key).join("superseded");
        let rd = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(&dir)(e)),
        };
        let mut out = vec![];
        for entry in rd {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Some(s) = read_yaml::<EvidenceSubmission>(&path)? {
                out.push(s);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn list_submissions(&self) -> StoreResult<Vec<EvidenceSubmission>> {
        let mut out = vec![];
        for task_dir in subdirs(&self.root.join("evidence"))? {
            for win_dir in subdirs(&task_dir)? {
                if let Some(s) = read_yaml(&win_dir.join(META_DIR).join("submission.yaml"))? {
                    out.push(s);
                }
            }
        }
        Ok(out)
    }

    fn save_validation(&self, report: &ValidationReport) -> StoreResult<()> {
        write_yaml(&self.meta_dir(&report.key()).join("validation.yaml"), report)
    }

    fn load_validation(&self, key: &TaskWindow) -> StoreResult<Option<ValidationReport>> {
        read_yaml(&self.meta_dir(key).join("validation.yaml"))
    }

    fn append_history(&self, key: &TaskWindow, entry: &SubmissionHistoryEntry) -> StoreResult<()> {
        let path = self.meta_dir(key).join("history.yaml");
        let mut entries: Vec<SubmissionHistoryEntry> = read_yaml(&path)?.unwrap_or_default();
        entries.push(entry.clone());
        write_yaml(&path, &entries)
    }

    fn load_history(&self, key: &TaskWindow) -> StoreResult<Vec<SubmissionHistoryEntry>> {
        Ok(read_yaml(&self.meta_dir(key).join("history.yaml"))?.unwrap_or_default())
    }

    fn save_batch(&self, batch: &SubmissionBatch) -> StoreResult<()> {
        write_yaml(&self.batch_manifest(&batch.batch_id), batch)
    }

    fn load_batch(&self, id: &BatchId) -> StoreResult<Option<SubmissionBatch>> {
        read_yaml(&self.batch_manifest(id))
    }

    fn list_batches(&self) -> StoreResult<Vec<SubmissionBatch>> {
        let mut out: Vec<SubmissionBatch> = vec![];
        for dir in subdirs(&self.root.join("submissions"))? {
            if let Some(b) = read_yaml(&dir.join("manifest.yaml"))? {
                out.push(b);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.batch_id.cmp(&a.batch_id)));
        Ok(out)
    }

    fn try_acquire_lease(&self, key: &TaskWindow, owner: &str, ttl_secs: i64) -> StoreResult<Option<Lease>> {
        self.with_lease_lock(key, |path| {
            let now = Utc::now();
            if let Some(held) = read_yaml::<Lease>(path)? {
                if !held.is_expired(now) {
                    debug!(task = %key, owner = %held.owner, expires_at = %held.expires_at, "lease held");
                    return Ok(None);
                }
                debug!(task = %key, owner = %held.owner, "taking over expired lease");
            }
            let lease = Lease::new(key.clone(), owner, now, ttl_secs);
            write_yaml(path, &lease)?;
            Ok(Some(lease))
        })
    }

    fn release_lease(&self, lease: &Lease) -> StoreResult<()> {
        self.with_lease_lock(&lease.key, |path| match read_yaml::<Lease>(path)? {
            Some(held) if held.id == lease.id => fs::remove_file(path).map_err(io_err(path)),
            _ => Ok(()),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerationMetadata {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    files: Vec<EvidenceFileEntry>,
}

/// Evidence files as written by the generation tools under `<data_dir>/evidence/<task>/<window>/`.
#[derive(Clone, Debug)]
pub struct FsEvidenceSource {
    pub root: PathBuf,
}

impl FsEvidenceSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scan(&self, dir: &Path) -> StoreResult<Vec<EvidenceFileRef>> {
        let mut files = vec![];
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let entry = entry.map_err(io_err(dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name == PLAN_FILE {
                continue;
            }
            let path = entry.path();
            let meta = entry.metadata().map_err(io_err(&path))?;
            if !meta.is_file() {
                continue;
            }
            let file = fs::File::open(&path).map_err(io_err(&path))?;
            let checksum = sha256_reader(file).map_err(io_err(&path))?;
            files.push(EvidenceFileRef {
                size_bytes: meta.len(),
                checksum_sha256: Some(checksum),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                ..EvidenceFileRef::named(name)
            });
        }
        Ok(files)
    }
}

impl EvidenceSource for FsEvidenceSource {
    fn list_task_files(&self, key: &TaskWindow) -> StoreResult<Vec<EvidenceFileRef>> {
        let dir = window_dir(&self.root, key);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(format!("evidence for {key}")));
        }
        let scanned = self.scan(&dir)?;
        let meta: GenerationMetadata = read_yaml(&dir.join(GENERATION_METADATA))?.unwrap_or_default();
        Ok(resolve_file_entries(scanned, meta.files, meta.source.as_deref())?)
    }

    fn read_file(&self, key: &TaskWindow, filename: &str) -> StoreResult<Vec<u8>> {
        if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
            return Err(StoreError::InvalidName(filename.to_string()));
        }
        let path = window_dir(&self.root, key).join(filename);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(format!("{filename} in {key}")),
            _ => io_err(&path)(e),
        })
    }

    fn collection_plan(&self, key: &TaskWindow) -> StoreResult<Option<CollectionPlan>> {
        let plan: Option<CollectionPlan> = read_yaml(&window_dir(&self.root, key).join(PLAN_FILE))?;
        // Some generators write a percentage.
        Ok(plan.map(|mut p| {
            if p.completeness > 1.0 {
                p.completeness /= 100.0;
            }
            p
        }))
    }
}
