//! Metrics definitions for the aggregator.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Reads answered from the cache without touching upstream",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Reads that required a fetch-through to upstream",
};

pub const CACHE_STALE: MetricDef = MetricDef {
    name: "cache.stale",
    metric_type: MetricType::Counter,
    description: "Reads answered with a previous payload after a failed fetch",
};

pub const FETCH_SUCCESS: MetricDef = MetricDef {
    name: "fetch.success",
    metric_type: MetricType::Counter,
    description: "Successful upstream fetches. Tagged with kind.",
};

pub const FETCH_FAILURE: MetricDef = MetricDef {
    name: "fetch.failure",
    metric_type: MetricType::Counter,
    description: "Failed upstream fetches. Tagged with kind.",
};

pub const FETCH_DURATION: MetricDef = MetricDef {
    name: "fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Upstream fetch duration in seconds, including all mirror attempts. Tagged with kind.",
};

pub const REFRESH_DURATION: MetricDef = MetricDef {
    name: "refresh.duration",
    metric_type: MetricType::Histogram,
    description: "Time to refresh every registered source in seconds",
};

pub const SESSIONS_ACTIVE: MetricDef = MetricDef {
    name: "sessions.active",
    metric_type: MetricType::Gauge,
    description: "Admin sessions held in memory after the last sweep",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    CACHE_MISS,
    CACHE_STALE,
    FETCH_SUCCESS,
    FETCH_FAILURE,
    FETCH_DURATION,
    REFRESH_DURATION,
    SESSIONS_ACTIVE,
];
