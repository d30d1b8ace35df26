use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref STATUS_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_status_updates_total",
        "Total status records applied by the observer"
    ))
    .unwrap();
    pub static ref MALFORMED_RECORDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_malformed_records_total",
        "Total status payloads that could not be read as a record"
    ))
    .unwrap();
    pub static ref SUBSCRIPTION_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_subscription_errors_total",
        "Total status subscription failures"
    ))
    .unwrap();
    pub static ref RESUBSCRIPTIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_resubscriptions_total",
        "Total successful status re-subscriptions after a failure"
    ))
    .unwrap();
    pub static ref COMMANDS_DISPATCHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "dashboard_commands_dispatched_total",
            "Total commands written to the command key"
        ),
        &["command"]
    )
    .unwrap();
    pub static ref COMMAND_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_command_failures_total",
        "Total command writes rejected by the channel"
    ))
    .unwrap();
    pub static ref DISPATCH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "dashboard_dispatch_latency_seconds",
            "Time taken for the channel to accept a command"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    )
    .unwrap();
    pub static ref DEVICE_ONLINE: Gauge = Gauge::with_opts(Opts::new(
        "dashboard_device_online",
        "1 when the device is considered connected, 0 otherwise"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(STATUS_UPDATES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MALFORMED_RECORDS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SUBSCRIPTION_ERRORS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESUBSCRIPTIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMANDS_DISPATCHED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMAND_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DISPATCH_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(DEVICE_ONLINE.clone())).unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
