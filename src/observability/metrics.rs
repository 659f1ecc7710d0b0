//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `ansible_operator_reconciliations_total` - Total number of reconciliations
//! - `ansible_operator_reconciliation_errors_total` - Total number of failed or fatal reconciliations
//! - `ansible_operator_reconciliation_duration_seconds` - Duration of reconciliations
//! - `ansible_operator_proxy_requests_total{verb}` - Requests handled by the API proxy
//! - `ansible_operator_proxy_cache_hits_total` - Reads served from the proxy cache
//! - `ansible_operator_proxy_cache_misses_total` - Reads forwarded upstream
//! - `ansible_operator_dynamic_watches_total{channel}` - Dependent watches registered
//! - `ansible_operator_task_events_total{outcome}` - Classified automation task events

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ansible_operator_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ansible_operator_reconciliation_errors_total",
        "Total number of failed or fatal reconciliations",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "ansible_operator_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static PROXY_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ansible_operator_proxy_requests_total",
            "Total number of requests handled by the API proxy",
        ),
        &["verb"],
    )
    .expect("Failed to create PROXY_REQUESTS_TOTAL metric - this should never happen")
});

static PROXY_CACHE_HITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ansible_operator_proxy_cache_hits_total",
        "Total number of reads served from the proxy cache",
    )
    .expect("Failed to create PROXY_CACHE_HITS_TOTAL metric - this should never happen")
});

static PROXY_CACHE_MISSES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ansible_operator_proxy_cache_misses_total",
        "Total number of reads forwarded to the API server",
    )
    .expect("Failed to create PROXY_CACHE_MISSES_TOTAL metric - this should never happen")
});

static DYNAMIC_WATCHES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ansible_operator_dynamic_watches_total",
            "Total number of dependent resource watches registered",
        ),
        &["channel"],
    )
    .expect("Failed to create DYNAMIC_WATCHES_TOTAL metric - this should never happen")
});

static TASK_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ansible_operator_task_events_total",
            "Total number of classified automation task events",
        ),
        &["outcome"],
    )
    .expect("Failed to create TASK_EVENTS_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(PROXY_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROXY_CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROXY_CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DYNAMIC_WATCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TASK_EVENTS_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_proxy_requests(verb: &str) {
    PROXY_REQUESTS_TOTAL.with_label_values(&[verb]).inc();
}

pub fn increment_proxy_cache_hits() {
    PROXY_CACHE_HITS_TOTAL.inc();
}

pub fn increment_proxy_cache_misses() {
    PROXY_CACHE_MISSES_TOTAL.inc();
}

pub fn increment_dynamic_watches(channel: &str) {
    DYNAMIC_WATCHES_TOTAL.with_label_values(&[channel]).inc();
}

pub fn increment_task_events(outcome: &str) {
    TASK_EVENTS_TOTAL.with_label_values(&[outcome]).inc();
}
