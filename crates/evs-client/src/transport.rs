use async_trait::async_trait;
use evs_core::{RemoteSubmissionId, TaskRef};

use crate::api::{CreateSubmissionRequest, CreateSubmissionResponse, FileUpload, SubmissionStatusResponse, UploadedFile};

/// What went wrong on a single remote call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    /// 5xx, 408 and 429.
    #[error("platform unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },
    #[error("platform refused credentials ({status})")]
    Unauthorized { status: u16 },
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("platform rejected request ({status}): {reason}")]
    Rejected { status: u16, reason: String },
    #[error("malformed platform response: {0}")]
    Protocol(String),
}

/// The three remote endpoints. Implementations perform exactly one attempt per call.
#[async_trait]
pub trait PlatformTransport: Send + Sync {
    async fn upload_file(&self, task: &TaskRef, file: &FileUpload) -> Result<UploadedFile, TransportFailure>;

    async fn create_submission(
        &self,
        task: &TaskRef,
        idempotency_key: &str,
        request: &CreateSubmissionRequest,
    ) -> Result<CreateSubmissionResponse, TransportFailure>;

    async fn get_submission(
        &self,
        task: &TaskRef,
        id: &RemoteSubmissionId,
    ) -> Result<SubmissionStatusResponse, TransportFailure>;
}
