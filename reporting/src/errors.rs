use crate::types::{GroupKey, IsolationKey, Origin};
use thiserror::Error;
use url::Url;

/// Errors raised when a report cannot be queued.
#[derive(Error, Debug, PartialEq)]
pub enum ReportError {
    #[error("report url has an opaque origin: {0}")]
    OpaqueOrigin(Url),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// An endpoint selector handed back an endpoint that cannot serve a bucket.
/// These are contract violations by the collaborator, not delivery failures.
#[derive(Error, Debug, PartialEq)]
pub enum BatchError {
    #[error("endpoint isolation key {endpoint} does not match batch isolation key {batch}")]
    IsolationKeyMismatch {
        batch: IsolationKey,
        endpoint: IsolationKey,
    },

    #[error("report origin {report} does not match batch origin {batch}")]
    OriginMismatch { batch: Origin, report: Origin },

    #[error("report group {report} does not match endpoint group {endpoint}")]
    GroupMismatch { endpoint: String, report: String },

    #[error("host {host} is not covered by endpoint configuration {config}")]
    HostNotCovered { host: String, config: GroupKey },

    #[error("reports in a bucket must share one group key")]
    MixedBucket,

    #[error("cannot add an empty bucket")]
    EmptyBucket,
}

/// Errors returned by the `DeliveryAgent` handle.
#[derive(Error, Debug, PartialEq)]
pub enum AgentError {
    #[error("a flush cycle is already waiting on a permission check")]
    CycleInProgress,

    #[error("the delivery agent has shut down")]
    Stopped,
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("could not build http client: {0}")]
    Client(#[from] reqwest::Error),
}
