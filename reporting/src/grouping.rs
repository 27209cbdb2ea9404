//! Turns the reports of one flush cycle into batches.

use crate::batch::{Batch, Target};
use crate::endpoint_manager::EndpointSelector;
use crate::metrics_defs::REPORTS_DEFERRED;
use crate::types::{GroupKey, Origin, Report, ReportId};
use shared::counter;
use std::collections::{BTreeMap, HashSet};

/// Group keys with a batch in flight. At most one batch per group key may be
/// uploading at any time.
#[derive(Debug, Default)]
pub(crate) struct PendingGroups {
    groups: HashSet<GroupKey>,
}

impl PendingGroups {
    pub(crate) fn contains(&self, key: &GroupKey) -> bool {
        self.groups.contains(key)
    }

    fn claim(&mut self, key: GroupKey) {
        let inserted = self.groups.insert(key);
        debug_assert!(inserted, "group key claimed twice");
    }

    pub(crate) fn release<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a GroupKey>,
    {
        for key in keys {
            self.groups.remove(key);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<GroupKey> {
        let mut groups: Vec<GroupKey> = self.groups.iter().cloned().collect();
        groups.sort();
        groups
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }
}

/// Result of grouping one cycle's reports.
#[derive(Debug, Default)]
pub(crate) struct Assembly {
    pub(crate) batches: Vec<Batch>,
    /// Reports that were not placed in any batch and go back to the queue.
    pub(crate) deferred: Vec<ReportId>,
}

/// Sorts `reports` by group key and assigns every bucket of equal group key
/// to a batch, claiming the group key in `pending`. Buckets are deferred when
/// their origin is not allowed, their group already has a batch in flight,
/// or no endpoint is available.
pub(crate) fn assemble_batches(
    mut reports: Vec<Report>,
    allowed_origins: &HashSet<Origin>,
    pending: &mut PendingGroups,
    selector: &dyn EndpointSelector,
) -> Assembly {
    reports.sort_by(Report::cmp_group_key);

    let mut batches: BTreeMap<Target, Batch> = BTreeMap::new();
    let mut deferred = Vec::new();

    for bucket in reports.chunk_by(Report::same_group_key) {
        let group_key = bucket[0].group_key();

        if !allowed_origins.contains(&group_key.origin) {
            defer(&mut deferred, &group_key, bucket, "permission");
            continue;
        }

        if pending.contains(&group_key) {
            defer(&mut deferred, &group_key, bucket, "in_flight");
            continue;
        }

        let Some(endpoint) = selector.select(&group_key) else {
            defer(&mut deferred, &group_key, bucket, "no_endpoint");
            continue;
        };

        let target = Target {
            isolation_key: group_key.isolation_key.clone(),
            origin: group_key.origin.clone(),
            endpoint_url: endpoint.url.clone(),
        };
        let batch = batches
            .entry(target.clone())
            .or_insert_with(|| Batch::new(target));

        match batch.add_reports(&endpoint, bucket) {
            Ok(()) => pending.claim(group_key),
            Err(e) => {
                tracing::error!(
                    group = %group_key,
                    endpoint = %endpoint.url,
                    "Endpoint selector returned an unusable endpoint: {e}"
                );
                debug_assert!(false, "endpoint selector contract violation: {e}");
                defer(&mut deferred, &group_key, bucket, "contract_violation");
            }
        }
    }

    Assembly {
        batches: batches.into_values().filter(|b| !b.is_empty()).collect(),
        deferred,
    }
}

fn defer(
    deferred: &mut Vec<ReportId>,
    group_key: &GroupKey,
    bucket: &[Report],
    reason: &'static str,
) {
    tracing::debug!(group = %group_key, reports = bucket.len(), reason, "Deferring reports");
    counter!(REPORTS_DEFERRED, "reason" => reason).increment(bucket.len() as u64);
    deferred.extend(bucket.iter().map(|r| r.id));
}
