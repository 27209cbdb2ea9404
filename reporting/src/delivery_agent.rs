//! The delivery agent drains the report queue into batched uploads.
//!
//! All agent state lives in a single worker task. The worker reacts to store
//! change notifications, its delivery timer, commands from `DeliveryAgent`
//! handles, permission replies and upload completions, one at a time, so the
//! pending set and the batches never need locking.
//!
//! A flush cycle goes through two suspension points:
//!
//! ```text
//! Idle --start_cycle--> AwaitingPermission --permission reply--> dispatch --> Idle
//!                                                                   |
//!                                     one upload task per batch <---+
//!                                     (in flight until its outcome is processed)
//! ```

use crate::batch::Batch;
use crate::config::{DeliveryPolicy, deadline_after};
use crate::endpoint_manager::EndpointSelector;
use crate::errors::AgentError;
use crate::grouping::{Assembly, PendingGroups, assemble_batches};
use crate::metrics_defs::{
    BATCHES_DISPATCHED, FLUSH_CYCLES, REPORTS_DELIVERED, UPLOAD_OUTCOMES, UPLOAD_PAYLOAD_BYTES,
    UPLOADS_INFLIGHT,
};
use crate::permission::PermissionOracle;
use crate::store::{ReportStore, StoreEvent};
use crate::types::{GroupKey, Origin, Report, ReportId};
use crate::uploader::{UploadOutcome, Uploader};
use parking_lot::Mutex;
use shared::{counter, gauge, histogram};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// The collaborators a delivery agent works with.
#[derive(Clone)]
pub struct DeliveryContext {
    pub store: Arc<dyn ReportStore>,
    pub selector: Arc<dyn EndpointSelector>,
    pub permissions: Arc<dyn PermissionOracle>,
    pub uploader: Arc<dyn Uploader>,
}

/// What a single flush cycle did with the reports it found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub eligible: usize,
    pub batches: usize,
    pub dispatched_reports: usize,
    pub deferred_reports: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentStatus {
    pub in_flight_groups: Vec<GroupKey>,
    pub in_flight_uploads: usize,
    pub awaiting_permission: bool,
    pub timer_armed: bool,
}

type FlushReply = oneshot::Sender<Result<CycleSummary, AgentError>>;

enum Command {
    // Start a flush cycle outside of the delivery interval. The worker
    // replies once the cycle has dispatched its batches.
    Flush(FlushReply),
    Status(oneshot::Sender<AgentStatus>),
    Shutdown,
}

struct AgentInner {
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running delivery agent. Clones share the same worker; the
/// worker stops when `shutdown` is called or every handle is dropped.
#[derive(Clone)]
pub struct DeliveryAgent {
    inner: Arc<AgentInner>,
}

impl DeliveryAgent {
    /// Subscribes to the store and spawns the worker. Must be called from
    /// within a tokio runtime.
    pub fn new(context: DeliveryContext, policy: &DeliveryPolicy) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(COMMAND_CHANNEL_CAPACITY);
        let changes = context.store.subscribe();
        let worker = Worker::new(context, policy.delivery_interval());
        let handle = tokio::spawn(worker.run(rx, changes));

        DeliveryAgent {
            inner: Arc::new(AgentInner {
                tx,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    pub async fn flush(&self) -> Result<CycleSummary, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx)).await?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    pub async fn status(&self) -> Result<AgentStatus, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    /// Stops scheduling cycles and waits for the worker to exit. Uploads
    /// already in flight are left to finish; their outcomes are ignored.
    pub async fn shutdown(&self) {
        let _ = self.inner.tx.send(Command::Shutdown).await;
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("Delivery agent worker failed: {e}");
        }
    }

    async fn send(&self, command: Command) -> Result<(), AgentError> {
        self.inner
            .tx
            .send(command)
            .await
            .map_err(|_| AgentError::Stopped)
    }
}

/// A cycle waiting for the permission oracle. The reports are marked pending
/// in the store until the cycle dispatches or defers them.
struct PermissionCheck {
    reports: Vec<Report>,
    reply: Option<FlushReply>,
    check: JoinHandle<HashSet<Origin>>,
}

enum Phase {
    Idle,
    AwaitingPermission(PermissionCheck),
}

struct Worker {
    context: DeliveryContext,
    delivery_interval: Duration,
    pending: PendingGroups,
    phase: Phase,
    timer: Option<Instant>,
    uploads: JoinSet<UploadOutcome>,
    // Batches whose upload is running, keyed by the upload task.
    in_flight: HashMap<tokio::task::Id, Batch>,
}

impl Worker {
    fn new(context: DeliveryContext, delivery_interval: Duration) -> Self {
        Worker {
            context,
            delivery_interval,
            pending: PendingGroups::default(),
            phase: Phase::Idle,
            timer: None,
            uploads: JoinSet::new(),
            in_flight: HashMap::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut changes: broadcast::Receiver<StoreEvent>,
    ) {
        let mut listening = true;

        loop {
            let timer = self.timer;

            // Completions are handled before new work so that outcomes
            // release their groups before the next cycle looks at them.
            tokio::select! {
                biased;

                Some(completed) = self.uploads.join_next_with_id() => {
                    self.on_upload_complete(completed);
                }
                allowed = permission_reply(&mut self.phase) => {
                    self.on_permission_checked(allowed);
                }
                command = commands.recv() => match command {
                    Some(Command::Flush(reply)) => self.on_flush_requested(reply),
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = changes.recv(), if listening => match event {
                    Ok(StoreEvent::ReportsUpdated) | Err(RecvError::Lagged(_)) => {
                        self.on_reports_updated();
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Store notifications closed, relying on the timer");
                        listening = false;
                    }
                },
                _ = sleep_until(timer.unwrap_or_else(Instant::now)), if timer.is_some() => {
                    self.on_timer_fired();
                }
            }
        }

        self.stop();
    }

    fn stop(&mut self) {
        if let Phase::AwaitingPermission(check) = std::mem::replace(&mut self.phase, Phase::Idle) {
            check.check.abort();
            let ids: Vec<ReportId> = check.reports.iter().map(|r| r.id).collect();
            self.context.store.clear_pending(&ids);
            if let Some(reply) = check.reply {
                let _ = reply.send(Err(AgentError::Stopped));
            }
        }
        self.timer = None;
        self.uploads.detach_all();
        tracing::info!(
            abandoned_uploads = self.in_flight.len(),
            "Delivery agent stopped"
        );
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            in_flight_groups: self.pending.snapshot(),
            in_flight_uploads: self.in_flight.len(),
            awaiting_permission: !self.is_idle(),
            timer_armed: self.timer.is_some(),
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    fn arm_timer(&mut self) {
        self.timer = Some(deadline_after(Instant::now(), self.delivery_interval));
    }

    /// A store change starts a cycle right away unless the timer is already
    /// pacing deliveries.
    fn on_reports_updated(&mut self) {
        if self.timer.is_some() || !self.is_idle() || !self.context.store.has_reports() {
            return;
        }
        self.start_cycle(None);
        self.arm_timer();
    }

    /// The timer re-arms itself for as long as the store has reports.
    fn on_timer_fired(&mut self) {
        self.timer = None;
        if !self.context.store.has_reports() {
            return;
        }
        if self.is_idle() {
            self.start_cycle(None);
        } else {
            tracing::debug!("Previous cycle still waiting for permission, skipping this tick");
        }
        self.arm_timer();
    }

    fn on_flush_requested(&mut self, reply: FlushReply) {
        if !self.is_idle() {
            let _ = reply.send(Err(AgentError::CycleInProgress));
            return;
        }
        self.start_cycle(Some(reply));
        if self.timer.is_none() && self.context.store.has_reports() {
            self.arm_timer();
        }
    }

    fn start_cycle(&mut self, reply: Option<FlushReply>) {
        let reports = self.context.store.eligible_reports();
        if reports.is_empty() {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(CycleSummary::default()));
            }
            return;
        }

        counter!(FLUSH_CYCLES).increment(1);
        let ids: Vec<ReportId> = reports.iter().map(|r| r.id).collect();
        self.context.store.mark_pending(&ids);

        let origins: HashSet<Origin> = reports.iter().map(|r| r.origin.clone()).collect();
        tracing::debug!(
            reports = reports.len(),
            origins = origins.len(),
            "Checking report permissions"
        );
        let permissions = self.context.permissions.clone();
        let check = tokio::spawn(async move { permissions.allowed_origins(origins).await });

        self.phase = Phase::AwaitingPermission(PermissionCheck {
            reports,
            reply,
            check,
        });
    }

    fn on_permission_checked(&mut self, allowed: Result<HashSet<Origin>, JoinError>) {
        let Phase::AwaitingPermission(check) = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return;
        };

        let allowed = allowed.unwrap_or_else(|e| {
            tracing::error!("Permission check failed, deferring all reports: {e}");
            HashSet::new()
        });

        let summary = self.dispatch(check.reports, &allowed);
        tracing::debug!(
            ?summary,
            in_flight_groups = self.pending.len(),
            "Flush cycle dispatched"
        );
        if let Some(reply) = check.reply {
            let _ = reply.send(Ok(summary));
        }
    }

    /// Groups the cycle's reports into batches and starts one upload per
    /// batch. Reports left out are returned to the queue.
    fn dispatch(&mut self, reports: Vec<Report>, allowed: &HashSet<Origin>) -> CycleSummary {
        let eligible = reports.len();
        let Assembly {
            batches,
            mut deferred,
        } = assemble_batches(
            reports,
            allowed,
            &mut self.pending,
            self.context.selector.as_ref(),
        );

        let mut summary = CycleSummary {
            eligible,
            ..Default::default()
        };
        let now = Instant::now();

        for batch in batches {
            let request = match batch.upload_request(now) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(
                        endpoint = %batch.target().endpoint_url,
                        "Could not serialize batch: {e}"
                    );
                    self.pending.release(&batch.report_group_keys());
                    deferred.extend(batch.report_ids());
                    continue;
                }
            };

            tracing::debug!(
                origin = %request.origin,
                endpoint = %request.endpoint_url,
                reports = batch.len(),
                "Dispatching batch"
            );
            histogram!(UPLOAD_PAYLOAD_BYTES).record(request.payload.len() as f64);
            summary.batches += 1;
            summary.dispatched_reports += batch.len();

            let uploader = self.context.uploader.clone();
            let handle = self
                .uploads
                .spawn(async move { uploader.upload(request).await });
            self.in_flight.insert(handle.id(), batch);
        }

        counter!(BATCHES_DISPATCHED).increment(summary.batches as u64);
        gauge!(UPLOADS_INFLIGHT).set(self.in_flight.len() as f64);

        summary.deferred_reports = deferred.len();
        self.context.store.clear_pending(&deferred);
        summary
    }

    fn on_upload_complete(
        &mut self,
        completed: Result<(tokio::task::Id, UploadOutcome), JoinError>,
    ) {
        let (id, outcome) = match completed {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => {
                tracing::error!("Upload task failed: {e}");
                (e.id(), UploadOutcome::Failure)
            }
        };

        let Some(batch) = self.in_flight.remove(&id) else {
            return;
        };
        self.process_outcome(batch, outcome);
        gauge!(UPLOADS_INFLIGHT).set(self.in_flight.len() as f64);
    }

    fn process_outcome(&mut self, batch: Batch, outcome: UploadOutcome) {
        let store = &self.context.store;
        let target = batch.target();
        let ids = batch.report_ids();
        let success = outcome.is_success();

        for (group_key, count) in batch.reports_per_group() {
            store.record_delivery(group_key, &target.endpoint_url, count, success);
        }

        if success {
            store.remove(&ids);
            counter!(REPORTS_DELIVERED).increment(ids.len() as u64);
        } else {
            store.increment_attempts(&ids);
        }

        self.context
            .selector
            .report_outcome(&target.isolation_key, &target.endpoint_url, success);

        if outcome == UploadOutcome::RemoveEndpoint {
            // This is not scoped by isolation key. A rejection seen under one
            // isolation key also removes the endpoint for every other key
            // configured with the same url, which is observable across them.
            store.remove_endpoints_for_url(&target.endpoint_url);
        }

        self.pending.release(&batch.report_group_keys());
        store.clear_pending(&ids);

        counter!(UPLOAD_OUTCOMES, "outcome" => outcome.as_str()).increment(1);
        tracing::info!(
            origin = %target.origin,
            endpoint = %target.endpoint_url,
            reports = ids.len(),
            outcome = outcome.as_str(),
            "Upload complete"
        );
    }
}

async fn permission_reply(phase: &mut Phase) -> Result<HashSet<Origin>, JoinError> {
    match phase {
        Phase::AwaitingPermission(check) => (&mut check.check).await,
        Phase::Idle => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_manager::EndpointManager;
    use crate::permission::{AllowAll, OriginAllowList};
    use crate::store::MemoryStore;
    use crate::testutils::{
        ControlledUploader, GatedOracle, RecordingStore, ScriptedSelector, StoreCall, UploadCall,
        endpoint, endpoint_group, new_report, settle,
    };
    use crate::types::IsolationKey;
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;
    use url::Url;

    const ONE: &str = "https://one.example/upload";
    const TWO: &str = "https://two.example/upload";

    struct Harness {
        store: Arc<MemoryStore>,
        selector: Arc<ScriptedSelector>,
        calls: UnboundedReceiver<UploadCall>,
        agent: DeliveryAgent,
    }

    fn default_selector() -> ScriptedSelector {
        ScriptedSelector::new()
            .with(endpoint("https://a.example", "default", ONE))
            .with(endpoint("https://b.example", "default", TWO))
    }

    fn start(
        store: Arc<MemoryStore>,
        selector: ScriptedSelector,
        permissions: Arc<dyn PermissionOracle>,
    ) -> Harness {
        let selector = Arc::new(selector);
        let (uploader, calls) = ControlledUploader::new();
        let context = DeliveryContext {
            store: store.clone(),
            selector: selector.clone(),
            permissions,
            uploader,
        };
        let agent = DeliveryAgent::new(context, &DeliveryPolicy::default());
        Harness {
            store,
            selector,
            calls,
            agent,
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(&DeliveryPolicy::default()))
    }

    fn urls(call: &UploadCall) -> Vec<String> {
        let mut urls: Vec<String> = call
            .payload()
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["url"].as_str().unwrap().to_string())
            .collect();
        urls.sort();
        urls
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_with_empty_store() {
        let mut h = start(store(), default_selector(), Arc::new(AllowAll));
        assert_eq!(h.agent.flush().await, Ok(CycleSummary::default()));
        settle().await;
        assert!(h.calls.try_recv().is_err());
        assert!(!h.agent.status().await.unwrap().timer_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_batch_per_group() {
        let store = store();
        store.queue(new_report("https://a.example/1", "default")).unwrap();
        store.queue(new_report("https://a.example/2", "default")).unwrap();
        store.queue(new_report("https://b.example/1", "default")).unwrap();
        let mut h = start(store, default_selector(), Arc::new(AllowAll));

        let summary = h.agent.flush().await.unwrap();
        assert_eq!(
            summary,
            CycleSummary {
                eligible: 3,
                batches: 2,
                dispatched_reports: 3,
                deferred_reports: 0,
            }
        );

        let mut calls = vec![h.calls.recv().await.unwrap(), h.calls.recv().await.unwrap()];
        calls.sort_by(|a, b| a.request.endpoint_url.cmp(&b.request.endpoint_url));
        assert_eq!(calls[0].request.endpoint_url.as_str(), ONE);
        assert_eq!(calls[0].request.origin.to_string(), "https://a.example");
        assert_eq!(urls(&calls[0]), vec!["https://a.example/1", "https://a.example/2"]);
        assert_eq!(calls[1].request.endpoint_url.as_str(), TWO);
        assert_eq!(urls(&calls[1]), vec!["https://b.example/1"]);

        let status = h.agent.status().await.unwrap();
        assert_eq!(status.in_flight_groups.len(), 2);
        assert_eq!(status.in_flight_uploads, 2);

        for call in calls {
            call.complete(UploadOutcome::Success);
        }
        settle().await;

        assert_eq!(h.store.report_count(), 0);
        let status = h.agent.status().await.unwrap();
        assert!(status.in_flight_groups.is_empty());
        assert_eq!(status.in_flight_uploads, 0);
        assert_eq!(
            h.selector
                .outcomes()
                .iter()
                .filter(|(_, _, success)| *success)
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_with_upload_in_flight_is_deferred() {
        let store = store();
        store.queue(new_report("https://a.example/1", "default")).unwrap();
        let mut h = start(store, default_selector(), Arc::new(AllowAll));

        assert_eq!(h.agent.flush().await.unwrap().batches, 1);
        let first = h.calls.recv().await.unwrap();

        let second = h.store.queue(new_report("https://a.example/2", "default")).unwrap();
        let third = h.store.queue(new_report("https://a.example/3", "default")).unwrap();

        let summary = h.agent.flush().await.unwrap();
        assert_eq!(summary.eligible, 2);
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.deferred_reports, 2);
        assert!(!h.store.is_pending(second));
        assert!(!h.store.is_pending(third));

        // Once the first upload finishes the group can be delivered again
        first.complete(UploadOutcome::Success);
        settle().await;
        let summary = h.agent.flush().await.unwrap();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.dispatched_reports, 2);
        let call = h.calls.recv().await.unwrap();
        assert_eq!(urls(&call), vec!["https://a.example/2", "https://a.example/3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_retains_reports() {
        let store = store();
        let id = store.queue(new_report("https://a.example/1", "default")).unwrap();
        let mut h = start(store, default_selector(), Arc::new(AllowAll));

        h.agent.flush().await.unwrap();
        h.calls.recv().await.unwrap().complete(UploadOutcome::Failure);
        settle().await;

        let report = h.store.report(id).unwrap();
        assert_eq!(report.attempts, 1);
        assert!(!h.store.is_pending(id));
        assert_eq!(h.store.eligible_reports().len(), 1);
        assert_eq!(
            h.selector.outcomes(),
            vec![(IsolationKey::default(), Url::parse(ONE).unwrap(), false)]
        );

        // Retried on the next cycle
        assert_eq!(h.agent.flush().await.unwrap().batches, 1);
        h.calls.recv().await.unwrap().complete(UploadOutcome::Failure);
        settle().await;
        assert_eq!(h.store.report(id).unwrap().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_endpoint_outcome() {
        let store = store();
        store.set_endpoint_group(endpoint_group("https://a.example", "default", false, &[ONE]));
        let id = store.queue(new_report("https://a.example/1", "default")).unwrap();
        let mut h = start(store, default_selector(), Arc::new(AllowAll));

        h.agent.flush().await.unwrap();
        h.calls.recv().await.unwrap().complete(UploadOutcome::RemoveEndpoint);
        settle().await;

        let one = Url::parse(ONE).unwrap();
        assert!(!h.store.has_endpoint(&one));
        // Reports are retained for a later attempt
        assert_eq!(h.store.report(id).unwrap().attempts, 1);
        assert!(!h.store.is_pending(id));
        assert_eq!(h.selector.outcomes(), vec![(IsolationKey::default(), one, false)]);
        assert!(h.agent.status().await.unwrap().in_flight_groups.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_endpoint_for_batch_spanning_groups() {
        let memory = store();
        let first = memory.queue(new_report("https://a.example/1", "default")).unwrap();
        let csp = memory.queue(new_report("https://a.example/2", "csp")).unwrap();
        let second = memory.queue(new_report("https://a.example/3", "default")).unwrap();
        let recording = Arc::new(RecordingStore::new(memory.clone()));

        let default_endpoint = endpoint("https://a.example", "default", ONE);
        let csp_endpoint = endpoint("https://a.example", "csp", ONE);
        let selector = ScriptedSelector::new()
            .with(default_endpoint.clone())
            .with(csp_endpoint.clone());
        let (uploader, mut calls) = ControlledUploader::new();
        let context = DeliveryContext {
            store: recording.clone(),
            selector: Arc::new(selector),
            permissions: Arc::new(AllowAll),
            uploader,
        };
        let agent = DeliveryAgent::new(context, &DeliveryPolicy::default());

        // Both groups resolve to the same url and share one upload
        let summary = agent.flush().await.unwrap();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.dispatched_reports, 3);
        assert_eq!(agent.status().await.unwrap().in_flight_groups.len(), 2);
        recording.take_calls();

        calls.recv().await.unwrap().complete(UploadOutcome::RemoveEndpoint);
        settle().await;

        // Buckets are batched in group key order, so "csp" comes first
        let ids = vec![csp, first, second];
        let one = Url::parse(ONE).unwrap();
        assert_eq!(
            recording.take_calls(),
            vec![
                StoreCall::RecordDelivery {
                    group_key: csp_endpoint.group_key,
                    endpoint_url: one.clone(),
                    count: 1,
                    success: false,
                },
                StoreCall::RecordDelivery {
                    group_key: default_endpoint.group_key,
                    endpoint_url: one.clone(),
                    count: 2,
                    success: false,
                },
                StoreCall::IncrementAttempts(ids.clone()),
                StoreCall::RemoveEndpointsForUrl(one),
                StoreCall::ClearPending(ids),
            ]
        );
        assert!(agent.status().await.unwrap().in_flight_groups.is_empty());
        assert_eq!(memory.report(csp).unwrap().attempts, 1);
        assert_eq!(memory.eligible_reports().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_reports_are_deferred() {
        let store = store();
        store.queue(new_report("https://a.example/1", "default")).unwrap();
        let denied = store.queue(new_report("https://b.example/1", "default")).unwrap();
        let oracle = OriginAllowList::new(["https://a.example".parse().unwrap()]);
        let mut h = start(store, default_selector(), Arc::new(oracle));

        let summary = h.agent.flush().await.unwrap();
        assert_eq!(summary.eligible, 2);
        assert_eq!(summary.dispatched_reports + summary.deferred_reports, 2);
        assert_eq!(summary.deferred_reports, 1);

        let call = h.calls.recv().await.unwrap();
        assert_eq!(urls(&call), vec!["https://a.example/1"]);
        assert!(!h.store.is_pending(denied));
        assert_eq!(h.store.report(denied).unwrap().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_reports_are_deferred() {
        let store = store();
        let id = store.queue(new_report("https://c.example/1", "default")).unwrap();
        let mut h = start(store, default_selector(), Arc::new(AllowAll));

        let summary = h.agent.flush().await.unwrap();
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.deferred_reports, 1);
        settle().await;
        assert!(h.calls.try_recv().is_err());
        assert!(!h.store.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_while_awaiting_permission() {
        let store = store();
        let id = store.queue(new_report("https://a.example/1", "default")).unwrap();
        let oracle = Arc::new(GatedOracle::default());
        let mut h = start(store, default_selector(), oracle.clone());

        let agent = h.agent.clone();
        let first = tokio::spawn(async move { agent.flush().await });
        settle().await;

        assert!(h.store.is_pending(id));
        assert!(h.agent.status().await.unwrap().awaiting_permission);
        assert_eq!(h.agent.flush().await, Err(AgentError::CycleInProgress));

        oracle.open();
        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.batches, 1);
        assert!(h.calls.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_changes_and_timer_drive_cycles() {
        let mut h = start(store(), default_selector(), Arc::new(AllowAll));
        settle().await;
        assert!(!h.agent.status().await.unwrap().timer_armed);

        // Queueing a report starts a cycle right away and arms the timer
        let id = h.store.queue(new_report("https://a.example/1", "default")).unwrap();
        let call = h.calls.recv().await.unwrap();
        assert!(h.agent.status().await.unwrap().timer_armed);

        // Further changes while the timer is armed do not start cycles
        h.store.queue(new_report("https://b.example/1", "default")).unwrap();
        call.complete(UploadOutcome::Failure);
        settle().await;
        assert!(h.calls.try_recv().is_err());
        assert_eq!(h.store.report(id).unwrap().attempts, 1);

        // The timer delivers whatever is queued
        tokio::time::advance(Duration::from_secs(60)).await;
        let mut calls = vec![h.calls.recv().await.unwrap(), h.calls.recv().await.unwrap()];
        calls.sort_by(|a, b| a.request.endpoint_url.cmp(&b.request.endpoint_url));
        assert_eq!(urls(&calls[0]), vec!["https://a.example/1"]);
        assert_eq!(urls(&calls[1]), vec!["https://b.example/1"]);
        for call in calls {
            call.complete(UploadOutcome::Success);
        }
        settle().await;
        assert_eq!(h.store.report_count(), 0);

        // With an empty store the timer does not re-arm
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(!h.agent.status().await.unwrap().timer_armed);

        // And the next report is picked up by the store notification again
        h.store.queue(new_report("https://b.example/2", "default")).unwrap();
        let call = h.calls.recv().await.unwrap();
        assert_eq!(urls(&call), vec!["https://b.example/2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_is_computed_at_dispatch() {
        let store = store();
        store.queue(new_report("https://a.example/1", "default")).unwrap();
        let mut h = start(store, default_selector(), Arc::new(AllowAll));

        tokio::time::advance(Duration::from_millis(5000)).await;
        h.agent.flush().await.unwrap();
        let call = h.calls.recv().await.unwrap();
        assert_eq!(call.payload()[0]["age"], 5000);

        // A retry reports the age at the time of the retry
        call.complete(UploadOutcome::Failure);
        settle().await;
        tokio::time::advance(Duration::from_millis(2000)).await;
        h.agent.flush().await.unwrap();
        let call = h.calls.recv().await.unwrap();
        let age = call.payload()[0]["age"].as_u64().unwrap();
        assert!((7000..7010).contains(&age), "unexpected age {age}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_after_shutdown_are_ignored() {
        let store = store();
        let id = store.queue(new_report("https://a.example/1", "default")).unwrap();
        let mut h = start(store, default_selector(), Arc::new(AllowAll));

        h.agent.flush().await.unwrap();
        let call = h.calls.recv().await.unwrap();
        h.agent.shutdown().await;

        call.complete(UploadOutcome::Success);
        settle().await;
        assert!(h.store.report(id).is_some());
        assert_eq!(h.agent.flush().await, Err(AgentError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_awaiting_permission() {
        let store = store();
        let id = store.queue(new_report("https://a.example/1", "default")).unwrap();
        let h = start(store, default_selector(), Arc::new(GatedOracle::default()));

        let agent = h.agent.clone();
        let pending_flush = tokio::spawn(async move { agent.flush().await });
        settle().await;
        assert!(h.store.is_pending(id));

        h.agent.shutdown().await;
        assert_eq!(pending_flush.await.unwrap(), Err(AgentError::Stopped));
        assert!(!h.store.is_pending(id));
    }

    struct PanickingUploader;

    #[async_trait]
    impl Uploader for PanickingUploader {
        async fn upload(&self, _request: crate::uploader::UploadRequest) -> UploadOutcome {
            panic!("transport bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_upload_counts_as_failure() {
        let store = store();
        let id = store.queue(new_report("https://a.example/1", "default")).unwrap();
        let selector = Arc::new(default_selector());
        let context = DeliveryContext {
            store: store.clone(),
            selector: selector.clone(),
            permissions: Arc::new(AllowAll),
            uploader: Arc::new(PanickingUploader),
        };
        let agent = DeliveryAgent::new(context, &DeliveryPolicy::default());

        agent.flush().await.unwrap();
        settle().await;

        assert_eq!(store.report(id).unwrap().attempts, 1);
        assert!(!store.is_pending(id));
        assert!(agent.status().await.unwrap().in_flight_groups.is_empty());
        assert_eq!(selector.outcomes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subdomains_delivered_through_superdomain_configuration() {
        let store = store();
        store.set_endpoint_group(endpoint_group("https://example.com", "default", true, &[ONE]));
        store.queue(new_report("https://a.example.com/1", "default")).unwrap();
        store.queue(new_report("https://a.example.com/2", "default")).unwrap();
        store.queue(new_report("https://b.example.com/1", "default")).unwrap();

        let selector = Arc::new(EndpointManager::new(
            store.clone(),
            DeliveryPolicy::default().endpoint_backoff,
        ));
        let (uploader, mut calls) = ControlledUploader::new();
        let context = DeliveryContext {
            store: store.clone(),
            selector,
            permissions: Arc::new(AllowAll),
            uploader,
        };
        let agent = DeliveryAgent::new(context, &DeliveryPolicy::default());

        // Same endpoint, but one upload per report origin
        let summary = agent.flush().await.unwrap();
        assert_eq!(summary.batches, 2);
        for _ in 0..2 {
            let call = calls.recv().await.unwrap();
            assert_eq!(call.request.endpoint_url.as_str(), ONE);
            call.complete(UploadOutcome::Success);
        }
        settle().await;

        // Statistics are attributed to the configuration group
        let config_key = endpoint_group("https://example.com", "default", true, &[ONE]).key;
        let stats = store
            .endpoint_stats(&config_key, &Url::parse(ONE).unwrap())
            .unwrap();
        assert_eq!(stats.attempted_uploads, 2);
        assert_eq!(stats.successful_reports, 3);
        assert_eq!(store.report_count(), 0);
    }
}
