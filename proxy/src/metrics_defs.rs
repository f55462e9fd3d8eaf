use shared::metrics_defs::{MetricDef, MetricType};

pub const PROXY_REQUESTS: MetricDef = MetricDef {
    name: "proxy.requests",
    metric_type: MetricType::Counter,
    description: "Proxied requests by terminal outcome. Tagged with outcome.",
};

pub const PROXY_REQUEST_DURATION: MetricDef = MetricDef {
    name: "proxy.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to the terminal outcome of a proxied request in seconds. Tagged with outcome.",
};

pub const PROXY_STAGES_STARTED: MetricDef = MetricDef {
    name: "proxy.stages.started",
    metric_type: MetricType::Counter,
    description: "Outbound attempts started against peers",
};

pub const PROXY_STAGE_FAILURES: MetricDef = MetricDef {
    name: "proxy.stages.failed",
    metric_type: MetricType::Counter,
    description: "Outbound attempts that failed. Tagged with kind.",
};

pub const PROXY_WINNING_STAGE: MetricDef = MetricDef {
    name: "proxy.stages.winner",
    metric_type: MetricType::Histogram,
    description: "Index of the stage whose answer was returned",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PROXY_REQUESTS,
    PROXY_REQUEST_DURATION,
    PROXY_STAGES_STARTED,
    PROXY_STAGE_FAILURES,
    PROXY_WINNING_STAGE,
    REQUESTS_INFLIGHT,
];
