use chrono::{DateTime, Utc};
use evs_core::RemoteOutcome;
use serde::{Deserialize, Serialize};

/// One file ready to go on the wire.
#[derive(Clone, Debug)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: &'static str,
    pub checksum_sha256: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(filename: impl Into<String>, checksum_sha256: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        Self {
            content_type: content_type_for(&filename),
            filename,
            checksum_sha256: checksum_sha256.into(),
            bytes,
        }
    }
}

pub fn content_type_for(filename: &str) -> &'static str {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "yaml" | "yml" => "application/x-yaml",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub checksum_sha256: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSubmissionRequest {
    pub task_ref: String,
    pub window: String,
    pub attachments: Vec<String>,
    pub controls_covered: Vec<String>,
    pub notes: String,
    pub submitted_by: String,
    pub tags: Vec<String>,
    /// Remote id of a rejected submission this one replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSubmissionResponse {
    pub submission_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionStatusResponse {
    pub submission_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
}

impl SubmissionStatusResponse {
    /// Unknown statuses stay pending until the platform settles.
    pub fn outcome(&self) -> RemoteOutcome {
        match self.status.as_str() {
            "accepted" | "approved" => RemoteOutcome::Accepted,
            "rejected" => RemoteOutcome::Rejected {
                reason: self
                    .review_notes
                    .clone()
                    .unwrap_or_else(|| "rejected without review notes".to_string()),
            },
            _ => RemoteOutcome::Pending,
        }
    }
}

/// Error body returned with 4xx responses.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
