//! Delivery of queued reports to their configured endpoints.
//!
//! Reports are queued in a [`ReportStore`]. A [`DeliveryAgent`] periodically
//! collects the deliverable ones, asks a [`PermissionOracle`] which origins may
//! send, groups the reports into one [`Batch`] per destination and hands each
//! batch to an [`Uploader`]. Upload outcomes flow back into the store and the
//! [`EndpointSelector`].

pub mod batch;
pub mod config;
pub mod delivery_agent;
pub mod endpoint_manager;
pub mod errors;
mod grouping;
pub mod metrics_defs;
pub mod payload;
pub mod permission;
pub mod store;
pub mod types;
pub mod uploader;

#[cfg(test)]
mod testutils;

pub use batch::{Batch, Target};
pub use config::{BackoffPolicy, DeliveryPolicy, ValidationError};
pub use delivery_agent::{AgentStatus, CycleSummary, DeliveryAgent, DeliveryContext};
pub use endpoint_manager::{EndpointDirectory, EndpointManager, EndpointSelector};
pub use errors::{AgentError, BatchError, ReportError, UploadError};
pub use permission::{AllowAll, OriginAllowList, PermissionOracle};
pub use store::{EndpointStats, MemoryStore, ReportStore, StoreEvent};
pub use types::{
    Endpoint, EndpointGroup, EndpointInfo, GroupKey, IsolationKey, NewReport, Origin, Report,
    ReportId,
};
pub use uploader::{HttpUploader, UploadOutcome, UploadRequest, Uploader};
