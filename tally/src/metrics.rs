//! Prometheus metrics instrumentation for tally.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `tally_jobs_submitted_total` - Jobs accepted by the submission API
//! - `tally_job_transitions_total` - Committed job status changes
//! - `tally_tasks_total` - Delivered tasks by how they were settled
//! - `tally_jobs_abandoned_total` - Running jobs recovered from lost workers
//! - `tally_reports_generated_total` - Persisted reports
//!
//! ## Histograms
//! - `tally_provider_call_seconds` - Provider call duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, HistogramVec, IntCounter, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for tally metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `provider_id`, `job_type`.
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tally_jobs_submitted_total", "Total number of jobs submitted");
    CounterVec::new(opts, &["provider_id", "job_type"])
        .expect("tally_jobs_submitted_total metric creation failed")
});

/// Labels: `from`, `to`.
pub static JOB_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tally_job_transitions_total",
        "Total number of committed job status transitions",
    );
    CounterVec::new(opts, &["from", "to"])
        .expect("tally_job_transitions_total metric creation failed")
});

/// Labels: `task_kind`, `outcome` (`ack`, `retry`, `drop`).
pub static TASKS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tally_tasks_total", "Total number of settled broker tasks");
    CounterVec::new(opts, &["task_kind", "outcome"])
        .expect("tally_tasks_total metric creation failed")
});

/// Labels: `provider_id`.
pub static JOBS_ABANDONED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tally_jobs_abandoned_total",
        "Total number of running jobs recovered after their worker went silent",
    );
    CounterVec::new(opts, &["provider_id"])
        .expect("tally_jobs_abandoned_total metric creation failed")
});

pub static REPORTS_GENERATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tally_reports_generated_total", "Total number of reports persisted")
        .expect("tally_reports_generated_total metric creation failed")
});

/// Labels: `provider_id`, `outcome` (`success`, `retryable`, `permanent`, `timeout`).
pub static PROVIDER_CALL_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 14).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "tally_provider_call_seconds",
        "Provider call duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["provider_id", "outcome"])
        .expect("tally_provider_call_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOB_TRANSITIONS_TOTAL.clone()),
        Box::new(TASKS_TOTAL.clone()),
        Box::new(JOBS_ABANDONED_TOTAL.clone()),
        Box::new(REPORTS_GENERATED_TOTAL.clone()),
        Box::new(PROVIDER_CALL_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted(provider_id: &str, job_type: &str) {
    JOBS_SUBMITTED_TOTAL
        .with_label_values(&[provider_id, job_type])
        .inc();
}

pub fn record_transition(from: &str, to: &str) {
    JOB_TRANSITIONS_TOTAL.with_label_values(&[from, to]).inc();
}

pub fn record_task_outcome(task_kind: &str, outcome: &str) {
    TASKS_TOTAL.with_label_values(&[task_kind, outcome]).inc();
}

pub fn record_job_abandoned(provider_id: &str) {
    JOBS_ABANDONED_TOTAL.with_label_values(&[provider_id]).inc();
}

pub fn record_report_generated() {
    REPORTS_GENERATED_TOTAL.inc();
}

pub fn observe_provider_call(provider_id: &str, outcome: &str, duration_secs: f64) {
    PROVIDER_CALL_SECONDS
        .with_label_values(&[provider_id, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
