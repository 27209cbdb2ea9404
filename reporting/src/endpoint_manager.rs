use crate::config::{BackoffPolicy, deadline_after};
use crate::types::{Endpoint, GroupKey, IsolationKey};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

/// Maps a report group to the endpoint that should receive it this cycle.
pub trait EndpointSelector: Send + Sync {
    /// Returns `None` when no endpoint is currently usable. That is not an
    /// error, the group is simply skipped.
    fn select(&self, group_key: &GroupKey) -> Option<Endpoint>;

    fn report_outcome(&self, isolation_key: &IsolationKey, endpoint_url: &Url, success: bool);
}

/// Source of configured endpoints for a report group, including endpoints
/// inherited from a superdomain configured with `include_subdomains`.
pub trait EndpointDirectory: Send + Sync {
    fn candidate_endpoints(&self, group_key: &GroupKey) -> Vec<Endpoint>;
}

#[derive(Debug)]
struct BackoffEntry {
    failures: u32,
    release_at: Instant,
}

/// Picks endpoints by priority and weight, skipping endpoints that are
/// backing off after failed uploads.
pub struct EndpointManager {
    directory: Arc<dyn EndpointDirectory>,
    policy: BackoffPolicy,
    backoff: Mutex<HashMap<(IsolationKey, Url), BackoffEntry>>,
}

impl EndpointManager {
    pub fn new(directory: Arc<dyn EndpointDirectory>, policy: BackoffPolicy) -> Self {
        EndpointManager {
            directory,
            policy,
            backoff: Mutex::new(HashMap::new()),
        }
    }

    fn is_backing_off(&self, isolation_key: &IsolationKey, url: &Url, now: Instant) -> bool {
        self.backoff
            .lock()
            .get(&(isolation_key.clone(), url.clone()))
            .is_some_and(|entry| entry.release_at > now)
    }

    /// Forgets endpoints whose backoff ran out more than `maximum_backoff`
    /// ago, including endpoints that were removed or never succeed again.
    fn prune_expired(&self, now: Instant) {
        let horizon = self.policy.maximum_backoff();
        self.backoff
            .lock()
            .retain(|_, entry| now.saturating_duration_since(entry.release_at) <= horizon);
    }
}

impl EndpointSelector for EndpointManager {
    fn select(&self, group_key: &GroupKey) -> Option<Endpoint> {
        let now = Instant::now();
        self.prune_expired(now);
        let available: Vec<Endpoint> = self
            .directory
            .candidate_endpoints(group_key)
            .into_iter()
            .filter(|e| !self.is_backing_off(&group_key.isolation_key, &e.url, now))
            .collect();

        let best_priority = available.iter().map(|e| e.priority).min()?;
        let tied: Vec<Endpoint> = available
            .into_iter()
            .filter(|e| e.priority == best_priority)
            .collect();

        choose_weighted(tied)
    }

    fn report_outcome(&self, isolation_key: &IsolationKey, endpoint_url: &Url, success: bool) {
        let key = (isolation_key.clone(), endpoint_url.clone());
        let mut backoff = self.backoff.lock();

        if success {
            backoff.remove(&key);
            return;
        }

        let entry = backoff.entry(key).or_insert(BackoffEntry {
            failures: 0,
            release_at: Instant::now(),
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = self.policy.delay_for(entry.failures);
        entry.release_at = deadline_after(Instant::now(), delay);
        tracing::debug!(
            endpoint = %endpoint_url,
            failures = entry.failures,
            delay_secs = delay.as_secs(),
            "Endpoint backing off"
        );
    }
}

/// Weighted random choice among endpoints of equal priority. Falls back to
/// the first endpoint when every weight is zero.
fn choose_weighted(mut candidates: Vec<Endpoint>) -> Option<Endpoint> {
    let total: u64 = candidates.iter().map(|e| u64::from(e.weight)).sum();
    if total == 0 {
        return candidates.into_iter().next();
    }

    let mut pick = rand::thread_rng().gen_range(0..total);
    let index = candidates
        .iter()
        .position(|e| {
            let weight = u64::from(e.weight);
            if pick < weight {
                true
            } else {
                pick -= weight;
                false
            }
        })
        .unwrap_or(candidates.len() - 1);

    Some(candidates.swap_remove(index))
}
