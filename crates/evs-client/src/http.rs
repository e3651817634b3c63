use std::time::Duration;

use async_trait::async_trait;
use evs_core::{RemoteSubmissionId, TaskRef};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::api::{
    CreateSubmissionRequest, CreateSubmissionResponse, ErrorBody, FileUpload, SubmissionStatusResponse, UploadedFile,
};
use crate::transport::{PlatformTransport, TransportFailure};

pub const HEADER_FILENAME: &str = "X-Evidence-Filename";
pub const HEADER_CHECKSUM: &str = "X-Content-SHA256";
pub const HEADER_IDEMPOTENCY: &str = "Idempotency-Key";

/// reqwest-backed transport with bearer auth.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, task: &TaskRef, tail: &str) -> String {
        format!("{}/evidence/{}/{}", self.base_url, task, tail)
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportFailure {
    if e.is_timeout() {
        TransportFailure::Timeout
    } else if e.is_decode() {
        TransportFailure::Protocol(e.to_string())
    } else {
        TransportFailure::Connect(e.to_string())
    }
}

/// Sort a non-2xx response into the failure taxonomy.
async fn check(resp: Response) -> Result<Response, TransportFailure> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let code = status.as_u16();
    let text = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TransportFailure::Unauthorized { status: code });
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TransportFailure::Unavailable { status: code, message: text });
    }
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let reason = body.message.unwrap_or(text);
    if body.code.as_deref() == Some("checksum_mismatch") {
        return Err(TransportFailure::ChecksumMismatch(reason));
    }
    Err(TransportFailure::Rejected { status: code, reason })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, TransportFailure> {
    let resp = check(resp).await?;
    resp.json::<T>().await.map_err(|e| TransportFailure::Protocol(e.to_string()))
}

#[async_trait]
impl PlatformTransport for HttpTransport {
    async fn upload_file(&self, task: &TaskRef, file: &FileUpload) -> Result<UploadedFile, TransportFailure> {
        let resp = self
            .client
            .post(self.url(task, "files"))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, file.content_type)
            .header(HEADER_FILENAME, &file.filename)
            .header(HEADER_CHECKSUM, &file.checksum_sha256)
            .body(file.bytes.clone())
            .send()
            .await
            .map_err(map_reqwest)?;
        decode(resp).await
    }

    async fn create_submission(
        &self,
        task: &TaskRef,
        idempotency_key: &str,
        request: &CreateSubmissionRequest,
    ) -> Result<CreateSubmissionResponse, TransportFailure> {
        let resp = self
            .client
            .post(self.url(task, "submissions"))
            .bearer_auth(&self.token)
            .header(HEADER_IDEMPOTENCY, idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest)?;
        decode(resp).await
    }

    async fn get_submission(
        &self,
        task: &TaskRef,
        id: &RemoteSubmissionId,
    ) -> Result<SubmissionStatusResponse, TransportFailure> {
        let resp = self
            .client
            .get(self.url(task, &format!("submissions/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_reqwest)?;
        decode(resp).await
    }
}
