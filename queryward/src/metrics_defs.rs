use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS_TOTAL: MetricDef = MetricDef {
    name: "requests_total",
    metric_type: MetricType::Counter,
    description: "Requests handled. Tagged with route, status.",
};

pub const REWRITE_DURATION: MetricDef = MetricDef {
    name: "rewrite_duration_seconds",
    metric_type: MetricType::Histogram,
    description: "Query rewrite duration in seconds. Tagged with route.",
};

pub const UPSTREAM_DURATION: MetricDef = MetricDef {
    name: "upstream_duration_seconds",
    metric_type: MetricType::Histogram,
    description: "Upstream round-trip duration in seconds. Tagged with upstream, status.",
};

pub const TOKEN_FAILURES: MetricDef = MetricDef {
    name: "auth_token_failures_total",
    metric_type: MetricType::Counter,
    description: "Bearer tokens rejected by the verifier.",
};

pub const TENANT_FAILURES: MetricDef = MetricDef {
    name: "tenant_resolution_failures_total",
    metric_type: MetricType::Counter,
    description: "Tenant resolutions that failed or produced an empty set.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS_TOTAL,
    REWRITE_DURATION,
    UPSTREAM_DURATION,
    TOKEN_FAILURES,
    TENANT_FAILURES,
];
