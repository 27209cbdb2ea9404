use crate::errors::BatchError;
use crate::payload::serialize_reports;
use crate::types::{Endpoint, GroupKey, IsolationKey, Origin, Report, ReportId, is_subdomain_of};
use crate::uploader::UploadRequest;
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;
use url::Url;

/// Where a batch is delivered. All reports uploaded together share these.
///
/// `origin` is the origin of the reports, which is not necessarily the origin
/// of the endpoint's configuration group: a group configured with
/// `include_subdomains` serves its subdomains too. Reports under different
/// group keys end up in the same batch when they share isolation key and
/// report origin and resolve to the same endpoint URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub isolation_key: IsolationKey,
    pub origin: Origin,
    pub endpoint_url: Url,
}

/// One upload in the making.
#[derive(Debug)]
pub struct Batch {
    target: Target,
    reports: Vec<Report>,
    // Keyed by the endpoint's configuration group, for delivery statistics.
    reports_per_group: BTreeMap<GroupKey, usize>,
}

impl Batch {
    pub fn new(target: Target) -> Self {
        Batch {
            target,
            reports: Vec::new(),
            reports_per_group: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn reports(&self) -> &[Report] {
        &self.reports
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn reports_per_group(&self) -> impl Iterator<Item = (&GroupKey, usize)> {
        self.reports_per_group.iter().map(|(key, count)| (key, *count))
    }

    /// Adds a bucket of reports sharing one group key, delivered via
    /// `endpoint`. Nothing is added if the bucket does not fit this batch.
    pub fn add_reports(
        &mut self,
        endpoint: &Endpoint,
        bucket: &[Report],
    ) -> Result<(), BatchError> {
        self.check_bucket(endpoint, bucket)?;

        *self
            .reports_per_group
            .entry(endpoint.group_key.clone())
            .or_default() += bucket.len();
        self.reports.extend_from_slice(bucket);
        Ok(())
    }

    fn check_bucket(&self, endpoint: &Endpoint, bucket: &[Report]) -> Result<(), BatchError> {
        let config = &endpoint.group_key;
        let first = bucket.first().ok_or(BatchError::EmptyBucket)?;

        if config.isolation_key != self.target.isolation_key {
            return Err(BatchError::IsolationKeyMismatch {
                batch: self.target.isolation_key.clone(),
                endpoint: config.isolation_key.clone(),
            });
        }
        if !is_subdomain_of(self.target.origin.host(), config.origin.host()) {
            return Err(BatchError::HostNotCovered {
                host: self.target.origin.host().to_string(),
                config: config.clone(),
            });
        }

        for report in bucket {
            if !report.same_group_key(first) {
                return Err(BatchError::MixedBucket);
            }
            if report.isolation_key != self.target.isolation_key {
                return Err(BatchError::IsolationKeyMismatch {
                    batch: self.target.isolation_key.clone(),
                    endpoint: report.isolation_key.clone(),
                });
            }
            if report.origin != self.target.origin {
                return Err(BatchError::OriginMismatch {
                    batch: self.target.origin.clone(),
                    report: report.origin.clone(),
                });
            }
            if report.group != config.group {
                return Err(BatchError::GroupMismatch {
                    endpoint: config.group.clone(),
                    report: report.group.clone(),
                });
            }
            // The origin host, which for `blob:` URLs is the wrapped URL's host.
            let host = report.origin.host();
            if !is_subdomain_of(host, config.origin.host()) {
                return Err(BatchError::HostNotCovered {
                    host: host.to_string(),
                    config: config.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn report_ids(&self) -> Vec<ReportId> {
        self.reports.iter().map(|r| r.id).collect()
    }

    /// Group keys of the reports themselves. These are what the agent holds
    /// in its pending set while the batch is in flight.
    pub fn report_group_keys(&self) -> BTreeSet<GroupKey> {
        self.reports.iter().map(Report::group_key).collect()
    }

    pub fn max_depth(&self) -> u32 {
        self.reports.iter().map(|r| r.depth).max().unwrap_or(0)
    }

    pub fn upload_request(&self, now: Instant) -> Result<UploadRequest, serde_json::Error> {
        Ok(UploadRequest {
            origin: self.target.origin.clone(),
            endpoint_url: self.target.endpoint_url.clone(),
            isolation_key: self.target.isolation_key.clone(),
            payload: serialize_reports(&self.reports, now)?,
            max_depth: self.max_depth(),
        })
    }
}
