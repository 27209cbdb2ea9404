//! Metrics definitions for report delivery.

use shared::metrics_defs::{MetricDef, MetricType};

pub const FLUSH_CYCLES: MetricDef = MetricDef {
    name: "delivery.cycles",
    metric_type: MetricType::Counter,
    description: "Number of flush cycles that found eligible reports",
};

pub const REPORTS_DEFERRED: MetricDef = MetricDef {
    name: "delivery.reports.deferred",
    metric_type: MetricType::Counter,
    description: "Reports left queued by a flush cycle. Tagged with reason.",
};

pub const BATCHES_DISPATCHED: MetricDef = MetricDef {
    name: "delivery.batches.dispatched",
    metric_type: MetricType::Counter,
    description: "Number of batches handed to the uploader",
};

pub const UPLOAD_OUTCOMES: MetricDef = MetricDef {
    name: "delivery.uploads.outcome",
    metric_type: MetricType::Counter,
    description: "Completed uploads. Tagged with outcome.",
};

pub const REPORTS_DELIVERED: MetricDef = MetricDef {
    name: "delivery.reports.delivered",
    metric_type: MetricType::Counter,
    description: "Reports removed from the queue after a successful upload",
};

pub const UPLOAD_PAYLOAD_BYTES: MetricDef = MetricDef {
    name: "delivery.uploads.payload_bytes",
    metric_type: MetricType::Histogram,
    description: "Size of serialized upload payloads in bytes",
};

pub const UPLOADS_INFLIGHT: MetricDef = MetricDef {
    name: "delivery.uploads.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of uploads waiting for an outcome",
};

pub const ALL_METRICS: &[MetricDef] = &[
    FLUSH_CYCLES,
    REPORTS_DEFERRED,
    BATCHES_DISPATCHED,
    UPLOAD_OUTCOMES,
    REPORTS_DELIVERED,
    UPLOAD_PAYLOAD_BYTES,
    UPLOADS_INFLIGHT,
];
