use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evs_core::{EvidenceSubmission, FileHandle, RemoteOutcome, RemoteSubmissionId, TaskRef};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::api::{CreateSubmissionRequest, FileUpload, UploadedFile};
use crate::cancel::CancelSignal;
use crate::retry::{decide_retry, FailureClass, RetryDecision, RetryPolicy};
use crate::transport::{PlatformTransport, TransportFailure};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("checksum mismatch uploading {filename} (retried once): {detail}")]
    Integrity { filename: String, detail: String },
    #[error("platform rejected the submission: {reason}")]
    Rejected { status: u16, reason: String },
    #[error("platform refused credentials ({status})")]
    Authentication { status: u16 },
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Transport {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportFailure,
    },
    #[error("cancelled before {0}")]
    Cancelled(String),
}

/// Acknowledgement of a created remote submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub remote_id: RemoteSubmissionId,
    pub status: String,
    pub message: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<FileHandle>,
    pub idempotency_key: String,
}

/// Upload, submit and status calls with checksums, idempotency and retries.
#[derive(Clone)]
pub struct SubmissionClient {
    transport: Arc<dyn PlatformTransport>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl SubmissionClient {
    pub fn new(transport: Arc<dyn PlatformTransport>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            transport,
            policy,
            call_timeout,
        }
    }

    /// One bounded attempt. A timeout counts as a transient failure.
    async fn attempt<T, F>(&self, fut: F) -> Result<T, TransportFailure>
    where
        F: Future<Output = Result<T, TransportFailure>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(TransportFailure::Timeout),
        }
    }

    /// Sleep for `delay` unless cancelled first.
    async fn backoff(&self, delay: Duration, cancel: &CancelSignal, before: &str) -> Result<(), ClientError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(ClientError::Cancelled(before.to_string())),
        }
    }

    fn surface(&self, operation: &str, attempts: u32, failure: TransportFailure) -> ClientError {
        match failure {
            TransportFailure::Rejected { status, reason } => ClientError::Rejected { status, reason },
            TransportFailure::Unauthorized { status } => ClientError::Authentication { status },
            source => ClientError::Transport {
                operation: operation.to_string(),
                attempts,
                source,
            },
        }
    }

    /// Upload one file. An integrity failure gets a single fresh re-upload, then is fatal.
    pub async fn upload_file(
        &self,
        task: &TaskRef,
        file: &FileUpload,
        cancel: &CancelSignal,
    ) -> Result<FileHandle, ClientError> {
        let operation = format!("upload of {}", file.filename);
        let mut attempts = 0u32;
        let mut integrity_failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled(operation));
            }
            attempts += 1;
            let result = self
                .attempt(self.transport.upload_file(task, file))
                .await
                .and_then(|up: UploadedFile| {
                    if up.checksum_sha256.eq_ignore_ascii_case(&file.checksum_sha256) {
                        Ok(up)
                    } else {
                        Err(TransportFailure::ChecksumMismatch(format!(
                            "platform recorded {}, expected {}",
                            up.checksum_sha256, file.checksum_sha256
                        )))
                    }
                });
            let failure = match result {
                Ok(up) => {
                    debug!(file = %file.filename, file_id = %up.file_id, "uploaded");
                    return Ok(FileHandle::new(up.file_id));
                }
                Err(f) => f,
            };

            let class = FailureClass::from(&failure);
            let counted = match class {
                FailureClass::Integrity => {
                    integrity_failures += 1;
                    integrity_failures
                }
                _ => attempts - integrity_failures,
            };
            let sample: f64 = rand::thread_rng().gen();
            match decide_retry(&self.policy, class, counted, sample) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        file = %file.filename,
                        attempt = attempts,
                        class = ?class,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying upload"
                    );
                    self.backoff(delay, cancel, &operation).await?;
                }
                RetryDecision::GiveUp => {
                    return Err(match failure {
                        TransportFailure::ChecksumMismatch(detail) => ClientError::Integrity {
                            filename: file.filename.clone(),
                            detail,
                        },
                        other => self.surface(&operation, attempts, other),
                    })
                }
            }
        }
    }

    /// Upload every file, then create the submission record under a deterministic
    /// idempotency token so an ambiguous retry returns the original record.
    pub async fn submit(
        &self,
        submission: &EvidenceSubmission,
        files: &[FileUpload],
        replaces: Option<&RemoteSubmissionId>,
        cancel: &CancelSignal,
    ) -> Result<SubmitReceipt, ClientError> {
        let task = &submission.task_ref;
        let mut attachments = Vec::with_capacity(files.len());
        for file in files {
            attachments.push(self.upload_file(task, file, cancel).await?);
        }

        let key = submission.idempotency_token();
        let request = CreateSubmissionRequest {
            task_ref: submission.task_ref.to_string(),
            window: submission.window.to_string(),
            attachments: attachments.iter().map(|h| h.to_string()).collect(),
            controls_covered: submission.controls_covered(),
            notes: submission.notes.clone(),
            submitted_by: submission.submitted_by.clone(),
            tags: submission.tags.iter().cloned().collect(),
            replaces: replaces.map(|r| r.to_string()),
        };

        let operation = "create submission";
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled(operation.to_string()));
            }
            attempts += 1;
            let failure = match self
                .attempt(self.transport.create_submission(task, &key, &request))
                .await
            {
                Ok(resp) => {
                    info!(
                        task = %submission.key(),
                        remote_id = %resp.submission_id,
                        attempts,
                        "submission acknowledged"
                    );
                    return Ok(SubmitReceipt {
                        remote_id: RemoteSubmissionId::new(resp.submission_id),
                        status: resp.status,
                        message: resp.message,
                        received_at: resp.received_at,
                        attachments,
                        idempotency_key: key,
                    });
                }
                Err(f) => f,
            };
            let class = FailureClass::from(&failure);
            let sample: f64 = rand::thread_rng().gen();
            match decide_retry(&self.policy, class, attempts, sample) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        task = %submission.key(),
                        attempt = attempts,
                        class = ?class,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying create submission"
                    );
                    self.backoff(delay, cancel, operation).await?;
                }
                RetryDecision::GiveUp => return Err(self.surface(operation, attempts, failure)),
            }
        }
    }

    /// Current remote verdict. Transient failures are retried like any other call.
    pub async fn check_status(&self, task: &TaskRef, id: &RemoteSubmissionId) -> Result<RemoteOutcome, ClientError> {
        let operation = "status check";
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let failure = match self.attempt(self.transport.get_submission(task, id)).await {
                Ok(resp) => return Ok(resp.outcome()),
                Err(f) => f,
            };
            let class = FailureClass::from(&failure);
            let sample: f64 = rand::thread_rng().gen();
            match decide_retry(&self.policy, class, attempts, sample) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(remote_id = %id, attempt = attempts, error = %failure, "retrying status check");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(self.surface(operation, attempts, failure)),
            }
        }
    }
}
