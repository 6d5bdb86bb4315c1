// Prometheus metrics for the throttle relay
//
// Exposes metrics on /metrics HTTP endpoint:
// - Rate limit decisions (counter)
// - Tracked and evicted keys (gauge, counter)
// - Queue depth and producer wait time (gauge, histogram)
// - Delivery outcomes and latency (counter, histogram)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Rate limit metrics
    pub static ref RATE_LIMIT_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limit_decisions_total", "Rate limit decisions by limiter and outcome"),
        &["limiter", "decision"]
    ).expect("Failed to create rate limit decisions metric");

    pub static ref RATE_LIMIT_TRACKED_KEYS: IntGauge = IntGauge::new(
        "rate_limit_tracked_keys",
        "Number of keys with live rate limit buckets"
    ).expect("Failed to create tracked keys metric");

    pub static ref RATE_LIMIT_EVICTED_KEYS_TOTAL: IntCounter = IntCounter::new(
        "rate_limit_evicted_keys_total",
        "Total number of idle buckets removed by the sweeper"
    ).expect("Failed to create evicted keys metric");

    pub static ref ATTEMPT_LOCKOUTS_TOTAL: IntCounter = IntCounter::new(
        "attempt_lockouts_total",
        "Total number of keys locked out by the attempt guard"
    ).expect("Failed to create lockouts metric");

    // Dispatch metrics
    pub static ref DISPATCH_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dispatch_enqueued_total", "Enqueue attempts by outcome"),
        &["outcome"]
    ).expect("Failed to create enqueued metric");

    pub static ref DISPATCH_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "dispatch_queue_depth",
        "Items currently buffered in the dispatch queue"
    ).expect("Failed to create queue depth metric");

    pub static ref DISPATCH_ENQUEUE_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("dispatch_enqueue_wait_seconds", "Time producers spent suspended on a full queue"),
    ).expect("Failed to create enqueue wait metric");

    pub static ref DISPATCH_DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dispatch_deliveries_total", "Delivery attempts by status"),
        &["status"]
    ).expect("Failed to create deliveries metric");

    pub static ref DISPATCH_DELIVERY_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("dispatch_delivery_duration_seconds", "Duration of a single delivery attempt"),
    ).expect("Failed to create delivery duration metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(RATE_LIMIT_DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_TRACKED_KEYS.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_EVICTED_KEYS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ATTEMPT_LOCKOUTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_ENQUEUED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_ENQUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_DELIVERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_DELIVERY_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
