use crate::endpoint_manager::EndpointSelector;
use crate::permission::PermissionOracle;
use crate::store::{MemoryStore, ReportStore, StoreEvent};
use crate::types::{
    Endpoint, EndpointGroup, EndpointInfo, GroupKey, IsolationKey, NewReport, Origin, Report,
    ReportId,
};
use crate::uploader::{UploadOutcome, UploadRequest, Uploader};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio::time::Instant;
use url::Url;

pub fn new_report(url: &str, group: &str) -> NewReport {
    NewReport {
        url: Url::parse(url).unwrap(),
        report_type: "test".into(),
        group: group.into(),
        user_agent: String::new(),
        body: serde_json::json!({}),
        depth: 0,
        isolation_key: IsolationKey::default(),
    }
}

pub fn report(id: u64, url: &str, group: &str) -> Report {
    Report::from_new(ReportId(id), new_report(url, group), Instant::now()).unwrap()
}

fn group_key(origin: &str, group: &str) -> GroupKey {
    GroupKey::new(IsolationKey::default(), origin.parse().unwrap(), group)
}

/// An endpoint at `url` configured for (`config_origin`, `group`).
pub fn endpoint(config_origin: &str, group: &str, url: &str) -> Endpoint {
    Endpoint {
        group_key: group_key(config_origin, group),
        url: Url::parse(url).unwrap(),
        priority: 1,
        weight: 1,
    }
}

pub fn endpoint_group(
    origin: &str,
    group: &str,
    include_subdomains: bool,
    urls: &[&str],
) -> EndpointGroup {
    EndpointGroup {
        key: group_key(origin, group),
        include_subdomains,
        endpoints: urls
            .iter()
            .map(|url| EndpointInfo {
                url: Url::parse(url).unwrap(),
                priority: 1,
                weight: 1,
            })
            .collect(),
    }
}

/// A mutating call made on a `RecordingStore`.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreCall {
    MarkPending(Vec<ReportId>),
    ClearPending(Vec<ReportId>),
    Remove(Vec<ReportId>),
    IncrementAttempts(Vec<ReportId>),
    RecordDelivery {
        group_key: GroupKey,
        endpoint_url: Url,
        count: usize,
        success: bool,
    },
    RemoveEndpointsForUrl(Url),
}

/// Delegates to a `MemoryStore` and records every mutation in call order.
pub struct RecordingStore {
    inner: Arc<MemoryStore>,
    calls: Mutex<Vec<StoreCall>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        RecordingStore {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns the calls recorded so far and forgets them.
    pub fn take_calls(&self) -> Vec<StoreCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().push(call);
    }
}

impl ReportStore for RecordingStore {
    fn eligible_reports(&self) -> Vec<Report> {
        self.inner.eligible_reports()
    }

    fn has_reports(&self) -> bool {
        self.inner.has_reports()
    }

    fn mark_pending(&self, ids: &[ReportId]) {
        self.record(StoreCall::MarkPending(ids.to_vec()));
        self.inner.mark_pending(ids);
    }

    fn clear_pending(&self, ids: &[ReportId]) {
        self.record(StoreCall::ClearPending(ids.to_vec()));
        self.inner.clear_pending(ids);
    }

    fn remove(&self, ids: &[ReportId]) {
        self.record(StoreCall::Remove(ids.to_vec()));
        self.inner.remove(ids);
    }

    fn increment_attempts(&self, ids: &[ReportId]) {
        self.record(StoreCall::IncrementAttempts(ids.to_vec()));
        self.inner.increment_attempts(ids);
    }

    fn record_delivery(
        &self,
        group_key: &GroupKey,
        endpoint_url: &Url,
        count: usize,
        success: bool,
    ) {
        self.record(StoreCall::RecordDelivery {
            group_key: group_key.clone(),
            endpoint_url: endpoint_url.clone(),
            count,
            success,
        });
        self.inner.record_delivery(group_key, endpoint_url, count, success);
    }

    fn remove_endpoints_for_url(&self, endpoint_url: &Url) {
        self.record(StoreCall::RemoveEndpointsForUrl(endpoint_url.clone()));
        self.inner.remove_endpoints_for_url(endpoint_url);
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}

/// Selector with a fixed report group to endpoint mapping that records outcomes.
#[derive(Default)]
pub struct ScriptedSelector {
    endpoints: HashMap<GroupKey, Endpoint>,
    outcomes: Mutex<Vec<(IsolationKey, Url, bool)>>,
}

impl ScriptedSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves reports of the endpoint's own configuration group.
    pub fn with(self, endpoint: Endpoint) -> Self {
        let key = endpoint.group_key.clone();
        self.with_key(key, endpoint)
    }

    /// Serves reports of (`origin`, `group`) with `endpoint`.
    pub fn with_for(self, origin: &str, group: &str, endpoint: Endpoint) -> Self {
        self.with_key(group_key(origin, group), endpoint)
    }

    fn with_key(mut self, key: GroupKey, endpoint: Endpoint) -> Self {
        self.endpoints.insert(key, endpoint);
        self
    }

    pub fn outcomes(&self) -> Vec<(IsolationKey, Url, bool)> {
        self.outcomes.lock().clone()
    }
}

impl EndpointSelector for ScriptedSelector {
    fn select(&self, group_key: &GroupKey) -> Option<Endpoint> {
        self.endpoints.get(group_key).cloned()
    }

    fn report_outcome(&self, isolation_key: &IsolationKey, endpoint_url: &Url, success: bool) {
        self.outcomes
            .lock()
            .push((isolation_key.clone(), endpoint_url.clone(), success));
    }
}

/// One upload waiting for the test to decide its outcome.
pub struct UploadCall {
    pub request: UploadRequest,
    respond: oneshot::Sender<UploadOutcome>,
}

impl UploadCall {
    pub fn payload(&self) -> serde_json::Value {
        serde_json::from_slice(&self.request.payload).unwrap()
    }

    pub fn complete(self, outcome: UploadOutcome) {
        let _ = self.respond.send(outcome);
    }
}

/// Uploader whose calls are handed to the test, which completes them at will.
pub struct ControlledUploader {
    calls: mpsc::UnboundedSender<UploadCall>,
}

impl ControlledUploader {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<UploadCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Arc::new(ControlledUploader { calls }), rx)
    }
}

#[async_trait]
impl Uploader for ControlledUploader {
    async fn upload(&self, request: UploadRequest) -> UploadOutcome {
        let (respond, outcome) = oneshot::channel();
        if self.calls.send(UploadCall { request, respond }).is_err() {
            return UploadOutcome::Failure;
        }
        outcome.await.unwrap_or(UploadOutcome::Failure)
    }
}

/// Allows every origin, but only once the gate has been opened.
#[derive(Default)]
pub struct GatedOracle {
    gate: Notify,
}

impl GatedOracle {
    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl PermissionOracle for GatedOracle {
    async fn allowed_origins(&self, origins: HashSet<Origin>) -> HashSet<Origin> {
        self.gate.notified().await;
        origins
    }
}

/// Lets every spawned task run until the runtime is idle. Only meaningful
/// with paused time, where the sleep completes once nothing else can progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
