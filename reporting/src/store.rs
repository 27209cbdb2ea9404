//! The report queue and endpoint configuration consumed by the delivery agent.
//!
//! `ReportStore` is the surface the agent mutates. `MemoryStore` is the
//! in-process implementation used by the binary and the tests; it owns report
//! lifetime, including the retention policy for reports that are too old or
//! have failed too often.

use crate::config::DeliveryPolicy;
use crate::endpoint_manager::EndpointDirectory;
use crate::errors::ReportError;
use crate::types::{Endpoint, EndpointGroup, EndpointInfo, GroupKey, NewReport, Report, ReportId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use url::Url;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Emitted whenever reports are queued, removed, updated or evicted.
/// Pending-marker changes are delivery bookkeeping and do not notify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    ReportsUpdated,
}

pub trait ReportStore: Send + Sync {
    /// All queued reports that are not currently pending delivery.
    fn eligible_reports(&self) -> Vec<Report>;

    /// Whether any report is queued, pending or not.
    fn has_reports(&self) -> bool;

    fn mark_pending(&self, ids: &[ReportId]);

    fn clear_pending(&self, ids: &[ReportId]);

    fn remove(&self, ids: &[ReportId]);

    fn increment_attempts(&self, ids: &[ReportId]);

    /// Records the outcome of an upload of `count` reports configured under
    /// `group_key` to `endpoint_url`.
    fn record_delivery(
        &self,
        group_key: &GroupKey,
        endpoint_url: &Url,
        count: usize,
        success: bool,
    );

    /// Drops every endpoint configuration pointing at `endpoint_url`.
    fn remove_endpoints_for_url(&self, endpoint_url: &Url);

    /// Subscribes to change notifications. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Per endpoint delivery statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub attempted_uploads: u64,
    pub successful_uploads: u64,
    pub attempted_reports: u64,
    pub successful_reports: u64,
}

struct StoredReport {
    report: Report,
    pending: bool,
    // Set when a pending report exceeds the retention policy. It is removed
    // as soon as its pending marker is cleared.
    doomed: bool,
}

struct StoredGroup {
    include_subdomains: bool,
    endpoints: Vec<EndpointInfo>,
}

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    reports: BTreeMap<ReportId, StoredReport>,
    endpoint_groups: BTreeMap<GroupKey, StoredGroup>,
    stats: HashMap<(GroupKey, Url), EndpointStats>,
}

pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    events: broadcast::Sender<StoreEvent>,
    max_report_attempts: u32,
    max_report_age: Duration,
}

impl MemoryStore {
    pub fn new(policy: &DeliveryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryStore {
            inner: Mutex::new(StoreInner::default()),
            events,
            max_report_attempts: policy.max_report_attempts,
            max_report_age: policy.max_report_age(),
        }
    }

    /// Queues a report, stamping it with the current instant.
    pub fn queue(&self, new: NewReport) -> Result<ReportId, ReportError> {
        let id = {
            let mut inner = self.inner.lock();
            let id = ReportId(inner.next_id);
            let report = Report::from_new(id, new, Instant::now())?;
            inner.next_id += 1;
            tracing::debug!(report = %id, origin = %report.origin, "Queued report");
            inner.reports.insert(
                id,
                StoredReport {
                    report,
                    pending: false,
                    doomed: false,
                },
            );
            id
        };
        self.notify();
        Ok(id)
    }

    pub fn set_endpoint_group(&self, group: EndpointGroup) {
        let mut inner = self.inner.lock();
        if group.endpoints.is_empty() {
            inner.endpoint_groups.remove(&group.key);
            return;
        }
        inner.endpoint_groups.insert(
            group.key,
            StoredGroup {
                include_subdomains: group.include_subdomains,
                endpoints: group.endpoints,
            },
        );
    }

    pub fn report(&self, id: ReportId) -> Option<Report> {
        self.inner.lock().reports.get(&id).map(|r| r.report.clone())
    }

    pub fn is_pending(&self, id: ReportId) -> bool {
        self.inner
            .lock()
            .reports
            .get(&id)
            .is_some_and(|r| r.pending)
    }

    pub fn report_count(&self) -> usize {
        self.inner.lock().reports.len()
    }

    pub fn endpoint_stats(
        &self,
        group_key: &GroupKey,
        endpoint_url: &Url,
    ) -> Option<EndpointStats> {
        self.inner
            .lock()
            .stats
            .get(&(group_key.clone(), endpoint_url.clone()))
            .copied()
    }

    pub fn has_endpoint(&self, endpoint_url: &Url) -> bool {
        self.inner
            .lock()
            .endpoint_groups
            .values()
            .any(|g| g.endpoints.iter().any(|e| &e.url == endpoint_url))
    }

    fn notify(&self) {
        // Sending fails only when nobody is subscribed.
        let _ = self.events.send(StoreEvent::ReportsUpdated);
    }

    /// Removes reports that outlived `max_report_age`. Returns true if any
    /// report was dropped.
    fn evict_expired(&self, inner: &mut StoreInner) -> bool {
        let now = Instant::now();
        let before = inner.reports.len();
        inner.reports.retain(|id, stored| {
            if stored.pending {
                return true;
            }
            let expired = now.saturating_duration_since(stored.report.queued) > self.max_report_age;
            if expired {
                tracing::debug!(report = %id, "Dropping expired report");
            }
            !expired
        });
        inner.reports.len() != before
    }
}

impl ReportStore for MemoryStore {
    fn eligible_reports(&self) -> Vec<Report> {
        let (reports, evicted) = {
            let mut inner = self.inner.lock();
            let evicted = self.evict_expired(&mut inner);
            let reports = inner
                .reports
                .values()
                .filter(|r| !r.pending && !r.doomed)
                .map(|r| r.report.clone())
                .collect();
            (reports, evicted)
        };
        if evicted {
            self.notify();
        }
        reports
    }

    fn has_reports(&self) -> bool {
        self.inner.lock().reports.values().any(|r| !r.doomed)
    }

    fn mark_pending(&self, ids: &[ReportId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            if let Some(stored) = inner.reports.get_mut(id) {
                stored.pending = true;
            }
        }
    }

    fn clear_pending(&self, ids: &[ReportId]) {
        let removed = {
            let mut inner = self.inner.lock();
            let mut removed = false;
            for id in ids {
                let doomed = match inner.reports.get_mut(id) {
                    Some(stored) => {
                        stored.pending = false;
                        stored.doomed
                    }
                    None => continue,
                };
                if doomed {
                    inner.reports.remove(id);
                    removed = true;
                }
            }
            removed
        };
        if removed {
            self.notify();
        }
    }

    fn remove(&self, ids: &[ReportId]) {
        let removed = {
            let mut inner = self.inner.lock();
            ids.iter()
                .filter(|id| inner.reports.remove(*id).is_some())
                .count()
        };
        if removed > 0 {
            self.notify();
        }
    }

    fn increment_attempts(&self, ids: &[ReportId]) {
        {
            let mut inner = self.inner.lock();
            let mut exhausted = Vec::new();
            for id in ids {
                let Some(stored) = inner.reports.get_mut(id) else {
                    continue;
                };
                stored.report.attempts += 1;
                if stored.report.attempts >= self.max_report_attempts {
                    if stored.pending {
                        stored.doomed = true;
                    } else {
                        exhausted.push(*id);
                    }
                }
            }
            for id in exhausted {
                tracing::debug!(report = %id, "Dropping report after too many attempts");
                inner.reports.remove(&id);
            }
        }
        self.notify();
    }

    fn record_delivery(
        &self,
        group_key: &GroupKey,
        endpoint_url: &Url,
        count: usize,
        success: bool,
    ) {
        let mut inner = self.inner.lock();
        let stats = inner
            .stats
            .entry((group_key.clone(), endpoint_url.clone()))
            .or_default();
        let count = count as u64;
        stats.attempted_uploads += 1;
        stats.attempted_reports += count;
        if success {
            stats.successful_uploads += 1;
            stats.successful_reports += count;
        }
    }

    fn remove_endpoints_for_url(&self, endpoint_url: &Url) {
        let mut inner = self.inner.lock();
        for group in inner.endpoint_groups.values_mut() {
            group.endpoints.retain(|e| &e.url != endpoint_url);
        }
        inner.endpoint_groups.retain(|_, g| !g.endpoints.is_empty());
        inner.stats.retain(|(_, url), _| url != endpoint_url);
        tracing::info!(endpoint = %endpoint_url, "Removed endpoint configurations");
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

impl EndpointDirectory for MemoryStore {
    fn candidate_endpoints(&self, group_key: &GroupKey) -> Vec<Endpoint> {
        let inner = self.inner.lock();

        if let Some(group) = inner.endpoint_groups.get(group_key) {
            return group
                .endpoints
                .iter()
                .map(|info| Endpoint::new(group_key.clone(), info))
                .collect();
        }

        // IP literals have no superdomains.
        let host = group_key.origin.host();
        if host.starts_with('[') || host.parse::<std::net::IpAddr>().is_ok() {
            return Vec::new();
        }

        // Walk up the superdomains looking for a group that covers subdomains.
        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            let key = GroupKey::new(
                group_key.isolation_key.clone(),
                group_key.origin.with_host(parent),
                group_key.group.clone(),
            );
            if let Some(group) = inner.endpoint_groups.get(&key)
                && group.include_subdomains
            {
                return group
                    .endpoints
                    .iter()
                    .map(|info| Endpoint::new(key.clone(), info))
                    .collect();
            }
            rest = parent;
        }

        Vec::new()
    }
}
