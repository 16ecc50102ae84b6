/// Metrics and telemetry for Sitehost
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Hostname resolution outcomes and lookup latency
/// - Claim attempts
/// - Billing event processing and reconciliation gaps
/// - Preview reminders and background jobs

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Encoder, Histogram,
    HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== Routing Metrics ==========

    /// Hostname resolver decisions by outcome
    pub static ref RESOLVER_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "resolver_outcomes_total",
        "Hostname resolver decisions",
        &["outcome"]
    )
    .unwrap();

    /// Tenant lookup latency in seconds
    pub static ref TENANT_LOOKUP_DURATION_SECONDS: Histogram = register_histogram!(
        "tenant_lookup_duration_seconds",
        "Tenant directory lookup latency in seconds",
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap();

    // ========== Lifecycle Metrics ==========

    /// Claim attempts by result
    pub static ref CLAIMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "claims_total",
        "Claim attempts by result",
        &["result"]
    )
    .unwrap();

    /// Billing events by type and result
    pub static ref BILLING_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "billing_events_total",
        "Billing provider events by type and result",
        &["event_type", "result"]
    )
    .unwrap();

    /// Payment captured but directory state not applied
    pub static ref RECONCILIATION_GAPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "reconciliation_gaps_total",
        "Billing events whose state transition could not be applied",
        &["kind"]
    )
    .unwrap();

    /// Preview reminders by status
    pub static ref REMINDERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "preview_reminders_total",
        "Preview expiry reminders by status",
        &["status"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record a hostname resolver decision
pub fn record_resolver_outcome(outcome: &str) {
    RESOLVER_OUTCOMES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a tenant lookup duration
pub fn record_lookup_duration(duration: f64) {
    TENANT_LOOKUP_DURATION_SECONDS.observe(duration);
}

/// Record a claim attempt
pub fn record_claim(result: &str) {
    CLAIMS_TOTAL.with_label_values(&[result]).inc();
}

/// Record a processed billing event
pub fn record_billing_event(event_type: &str, result: &str) {
    BILLING_EVENTS_TOTAL
        .with_label_values(&[event_type, result])
        .inc();
}

/// Record a reconciliation gap
pub fn record_reconciliation_gap(kind: &str) {
    RECONCILIATION_GAPS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a preview reminder
pub fn record_reminder(status: &str) {
    REMINDERS_TOTAL.with_label_values(&[status]).inc();
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}
