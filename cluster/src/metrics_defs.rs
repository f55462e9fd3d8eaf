use shared::metrics_defs::{MetricDef, MetricType};

pub const CLUSTER_CONNECTED: MetricDef = MetricDef {
    name: "cluster.connected",
    metric_type: MetricType::Gauge,
    description: "1 while the ensemble session is connected, 0 otherwise",
};

pub const CLUSTER_SESSION_EVENTS: MetricDef = MetricDef {
    name: "cluster.session.events",
    metric_type: MetricType::Counter,
    description: "Session connectivity changes. Tagged with event.",
};

pub const CLUSTER_CONNECT_FAILURES: MetricDef = MetricDef {
    name: "cluster.connect.failures",
    metric_type: MetricType::Counter,
    description: "Failed attempts to open an ensemble session",
};

pub const CLUSTER_EPHEMERALS_RECREATED: MetricDef = MetricDef {
    name: "cluster.ephemerals.recreated",
    metric_type: MetricType::Counter,
    description: "Ephemeral nodes recreated after the session was replaced",
};

pub const CLUSTER_WATCHED_PATHS: MetricDef = MetricDef {
    name: "cluster.watched_paths",
    metric_type: MetricType::Gauge,
    description: "Number of distinct watched paths",
};

pub const CLUSTER_SNAPSHOTS: MetricDef = MetricDef {
    name: "cluster.snapshots",
    metric_type: MetricType::Counter,
    description: "Children snapshots read from the ensemble and fanned out to consumers",
};

pub const CLUSTER_SIGNALS: MetricDef = MetricDef {
    name: "cluster.signals",
    metric_type: MetricType::Counter,
    description: "Connection signals fanned out to consumers. Tagged with event.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CLUSTER_CONNECTED,
    CLUSTER_SESSION_EVENTS,
    CLUSTER_CONNECT_FAILURES,
    CLUSTER_EPHEMERALS_RECREATED,
    CLUSTER_WATCHED_PATHS,
    CLUSTER_SNAPSHOTS,
    CLUSTER_SIGNALS,
];
