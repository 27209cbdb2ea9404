use crate::errors::UploadError;
use crate::types::{IsolationKey, Origin};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, ORIGIN};
use std::time::Duration;
use url::Url;

pub const REPORTS_CONTENT_TYPE: &str = "application/reports+json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Failure,
    /// The collector asked for the endpoint to be removed (410 Gone).
    RemoveEndpoint,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            UploadOutcome::Success => "success",
            UploadOutcome::Failure => "failure",
            UploadOutcome::RemoveEndpoint => "remove_endpoint",
        }
    }
}

/// Everything a transport needs to perform one upload.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub origin: Origin,
    pub endpoint_url: Url,
    pub isolation_key: IsolationKey,
    pub payload: Vec<u8>,
    /// Deepest redirect/call depth among the uploaded reports, used by the
    /// transport to avoid reporting loops.
    pub max_depth: u32,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> UploadOutcome;
}

/// Uploads reports with a single HTTP POST per batch.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpUploader { client })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, request: UploadRequest) -> UploadOutcome {
        tracing::debug!(
            endpoint = %request.endpoint_url,
            origin = %request.origin,
            bytes = request.payload.len(),
            max_depth = request.max_depth,
            "Starting upload"
        );

        let response = self
            .client
            .post(request.endpoint_url.clone())
            .header(CONTENT_TYPE, REPORTS_CONTENT_TYPE)
            .header(ORIGIN, request.origin.to_string())
            .body(request.payload)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => UploadOutcome::Success,
            Ok(response) if response.status() == StatusCode::GONE => UploadOutcome::RemoveEndpoint,
            Ok(response) => {
                tracing::warn!(
                    endpoint = %request.endpoint_url,
                    status = %response.status(),
                    "Upload rejected"
                );
                UploadOutcome::Failure
            }
            Err(e) => {
                tracing::warn!(endpoint = %request.endpoint_url, "Upload failed: {e}");
                UploadOutcome::Failure
            }
        }
    }
}
