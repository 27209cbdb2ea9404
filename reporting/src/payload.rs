//! Wire format for uploads: a bare JSON array with one object per report.

use crate::types::Report;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Serialize)]
struct WireReport<'a> {
    age: u64,
    #[serde(rename = "type")]
    report_type: &'a str,
    url: &'a str,
    user_agent: &'a str,
    body: &'a serde_json::Value,
}

/// Serializes `reports` in order. `age` is measured against `now`, so it must
/// be recomputed for every upload attempt.
pub fn serialize_reports(reports: &[Report], now: Instant) -> Result<Vec<u8>, serde_json::Error> {
    let wire: Vec<WireReport<'_>> = reports
        .iter()
        .map(|report| WireReport {
            age: u64::try_from(now.saturating_duration_since(report.queued).as_millis())
                .unwrap_or(u64::MAX),
            report_type: &report.report_type,
            url: report.url.as_str(),
            user_agent: &report.user_agent,
            body: &report.body,
        })
        .collect();

    serde_json::to_vec(&wire)
}
