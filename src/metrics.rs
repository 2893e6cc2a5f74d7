//metrics.rs
use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram, HistogramOpts, Opts};

lazy_static! {
    // Delivery metrics
    pub static ref NOTIFICATIONS_SENT: Counter = register_counter!(Opts::new(
        "notifications_sent_total",
        "Total number of device tokens the gateway accepted"
    ))
    .unwrap();

    pub static ref NOTIFICATIONS_FAILED: Counter = register_counter!(Opts::new(
        "notifications_failed_total",
        "Total number of device tokens that could not be delivered"
    ))
    .unwrap();

    pub static ref PARTITIONS_ATTEMPTED: Counter = register_counter!(Opts::new(
        "tenant_partitions_attempted_total",
        "Total number of per-tenant gateway calls attempted"
    ))
    .unwrap();

    pub static ref FATAL_DISPATCH_ABORTS: Counter = register_counter!(Opts::new(
        "fatal_dispatch_aborts_total",
        "Dispatches aborted because of tenant credential problems"
    ))
    .unwrap();

    // Registry metrics
    pub static ref REGISTRY_CACHE_HITS: Counter = register_counter!(Opts::new(
        "tenant_registry_cache_hits_total",
        "Total number of tenant gateway cache hits"
    ))
    .unwrap();

    pub static ref REGISTRY_CACHE_MISSES: Counter = register_counter!(Opts::new(
        "tenant_registry_cache_misses_total",
        "Total number of tenant gateway cache misses"
    ))
    .unwrap();

    pub static ref CREDENTIAL_LOADS: Counter = register_counter!(Opts::new(
        "credential_loads_total",
        "Total number of credential blobs read from the store"
    ))
    .unwrap();

    // Scheduler metrics
    pub static ref SCHEDULER_TICKS: Counter = register_counter!(Opts::new(
        "scheduler_ticks_total",
        "Total number of scheduler polls"
    ))
    .unwrap();

    pub static ref SCHEDULED_PROCESSED: Counter = register_counter!(Opts::new(
        "scheduled_notifications_processed_total",
        "Scheduled notifications moved to sent"
    ))
    .unwrap();

    // Timing metrics
    pub static ref DISPATCH_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "dispatch_time_seconds",
            "Time taken to fan a notification out to every tenant"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    )
    .unwrap();

    pub static ref GATEWAY_SEND_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "gateway_send_time_seconds",
            "Time taken by one per-tenant multicast send"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();
}

// Function to expose metrics endpoint
pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
