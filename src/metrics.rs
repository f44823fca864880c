use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    // Command path
    pub static ref TRANSACTIONS_POSTED: IntCounter = IntCounter::new(
        "ledger_transactions_posted_total",
        "Total accepted transactions (fresh accepts, not idempotent replays)"
    ).expect("metric can be created");

    pub static ref IDEMPOTENT_REPLAYS: IntCounter = IntCounter::new(
        "ledger_idempotent_replays_total",
        "Total PostTransaction calls answered from an existing event"
    ).expect("metric can be created");

    pub static ref COMMAND_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("ledger_command_duration_seconds", "PostTransaction duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["outcome"]
    ).expect("metric can be created");

    // Projector. Lag is the primary health metric.
    pub static ref PROJECTOR_LAG: IntGauge = IntGauge::new(
        "ledger_projector_lag",
        "max(event id) - durable offset for the projector identity"
    ).expect("metric can be created");

    pub static ref PROJECTED_EVENTS: IntCounter = IntCounter::new(
        "ledger_projected_events_total",
        "Events applied to read models"
    ).expect("metric can be created");

    pub static ref PROJECTION_ERRORS: IntCounter = IntCounter::new(
        "ledger_projection_errors_total",
        "Aborted projection passes"
    ).expect("metric can be created");

    // Outbox / delivery
    pub static ref OUTBOX_JOBS: IntCounterVec = IntCounterVec::new(
        Opts::new("ledger_outbox_jobs_total", "Outbox job state transitions"),
        &["state"]
    ).expect("metric can be created");

    pub static ref WEBHOOK_DELIVERIES: IntCounterVec = IntCounterVec::new(
        Opts::new("ledger_webhook_deliveries_total", "Webhook delivery attempts by status"),
        &["status"]
    ).expect("metric can be created");
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), Box<dyn std::error::Error>> {
    registry.register(Box::new(TRANSACTIONS_POSTED.clone()))?;
    registry.register(Box::new(IDEMPOTENT_REPLAYS.clone()))?;
    registry.register(Box::new(COMMAND_DURATION.clone()))?;
    registry.register(Box::new(PROJECTOR_LAG.clone()))?;
    registry.register(Box::new(PROJECTED_EVENTS.clone()))?;
    registry.register(Box::new(PROJECTION_ERRORS.clone()))?;
    registry.register(Box::new(OUTBOX_JOBS.clone()))?;
    registry.register(Box::new(WEBHOOK_DELIVERIES.clone()))?;
    Ok(())
}

/// Generate metrics output in Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
