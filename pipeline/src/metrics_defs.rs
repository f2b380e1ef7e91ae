use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "invocation.duration",
    metric_type: MetricType::Histogram,
    description: "Invocation duration in seconds. Tagged with status, handler.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "invocations.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of invocations currently being processed",
};

pub const DISPATCH_BATCHES: MetricDef = MetricDef {
    name: "dispatch.batches",
    metric_type: MetricType::Counter,
    description: "Batches formed by the dispatcher. Tagged with sink.",
};

pub const DISPATCH_RETRY_ROUNDS: MetricDef = MetricDef {
    name: "dispatch.retry_rounds",
    metric_type: MetricType::Counter,
    description: "Resubmissions of the failed subset of a batch. Tagged with sink.",
};

pub const DISPATCH_PERSISTENT_FAILURES: MetricDef = MetricDef {
    name: "dispatch.persistent_failures",
    metric_type: MetricType::Counter,
    description: "Items that still failed after the last retry round. Tagged with sink.",
};

pub const SUBMIT_ATTEMPTS: MetricDef = MetricDef {
    name: "submit.attempts",
    metric_type: MetricType::Histogram,
    description: "Attempts needed by a retried submission. Tagged with operation.",
};

pub const GENERATION_CACHE_HIT: MetricDef = MetricDef {
    name: "generation.cache.hit",
    metric_type: MetricType::Counter,
    description: "Generation requests answered from the cache",
};

pub const GENERATION_CACHE_MISS: MetricDef = MetricDef {
    name: "generation.cache.miss",
    metric_type: MetricType::Counter,
    description: "Generation requests that invoked the generator",
};

pub const BROADCAST_FAILURES: MetricDef = MetricDef {
    name: "broadcast.failures",
    metric_type: MetricType::Counter,
    description: "Notifications that could not be delivered to a live subscriber",
};

pub const SUBSCRIBERS_PRUNED: MetricDef = MetricDef {
    name: "broadcast.subscribers_pruned",
    metric_type: MetricType::Counter,
    description: "Gone subscribers removed from the registry",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    DISPATCH_BATCHES,
    DISPATCH_RETRY_ROUNDS,
    DISPATCH_PERSISTENT_FAILURES,
    SUBMIT_ATTEMPTS,
    GENERATION_CACHE_HIT,
    GENERATION_CACHE_MISS,
    BROADCAST_FAILURES,
    SUBSCRIBERS_PRUNED,
];
