//! Tracing and telemetry instrumentation for tally.
//!
//! Helpers for creating tracing spans and recording pipeline activity. Every
//! `record_*` function logs through `tracing` and, with the `metrics` feature,
//! updates the Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use tally::telemetry::{dispatch_span, record_job_submitted};
//!
//! let span = dispatch_span(&task_id, "execute_job", 1);
//! let _enter = span.enter();
//! record_job_submitted("acme", "processing");
//! ```

use std::future::Future;
use tracing::{Instrument, Span, info_span};

/// Create a tracing span for handling one delivered task.
#[must_use]
pub fn dispatch_span(
    task_id: impl AsRef<str>,
    task_kind: impl AsRef<str>,
    attempt: u32,
) -> Span {
    info_span!(
        "tally.dispatch",
        task_id = %task_id.as_ref(),
        task_kind = %task_kind.as_ref(),
        attempt = attempt,
    )
}

/// Create a tracing span for one provider call.
#[must_use]
pub fn provider_call_span(
    job_id: impl AsRef<str>,
    provider_id: impl AsRef<str>,
    attempt: u32,
) -> Span {
    info_span!(
        "tally.provider_call",
        job_id = %job_id.as_ref(),
        provider_id = %provider_id.as_ref(),
        attempt = attempt,
    )
}

/// Create a tracing span for job submission.
#[must_use]
pub fn submit_span(
    order_id: impl AsRef<str>,
    provider_id: impl AsRef<str>,
) -> Span {
    info_span!(
        "tally.submit",
        order_id = %order_id.as_ref(),
        provider_id = %provider_id.as_ref(),
    )
}

/// Create a tracing span for aggregating one window.
#[must_use]
pub fn aggregate_span(window: impl AsRef<str>) -> Span {
    info_span!("tally.aggregate", window = %window.as_ref())
}

/// Create a tracing span for a beat tick.
#[must_use]
pub fn beat_span() -> Span {
    info_span!("tally.beat")
}

/// Create a tracing span for a stale-job sweep.
#[must_use]
pub fn reap_span() -> Span {
    info_span!("tally.reap")
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    task_id: impl AsRef<str>,
    task_kind: impl AsRef<str>,
    attempt: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(task_id, task_kind, attempt))
}

/// Record an accepted job submission.
pub fn record_job_submitted(
    provider_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
) {
    tracing::info!(
        provider_id = %provider_id.as_ref(),
        job_type = %job_type.as_ref(),
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(provider_id.as_ref(), job_type.as_ref());
}

/// Record a committed status change.
pub fn record_transition(from: impl AsRef<str>, to: impl AsRef<str>) {
    tracing::debug!(
        from = %from.as_ref(),
        to = %to.as_ref(),
        "job transition"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_transition(from.as_ref(), to.as_ref());
}

/// Record how a delivered task was settled (`ack`, `retry`, `drop`).
pub fn record_task_outcome(
    task_kind: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    tracing::debug!(
        task_kind = %task_kind.as_ref(),
        outcome = %outcome.as_ref(),
        "task settled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_outcome(task_kind.as_ref(), outcome.as_ref());
}

/// Record a running job recovered from a lost worker.
pub fn record_job_abandoned(
    job_id: impl AsRef<str>,
    provider_id: impl AsRef<str>,
) {
    tracing::warn!(
        job_id = %job_id.as_ref(),
        provider_id = %provider_id.as_ref(),
        "running job abandoned"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_abandoned(provider_id.as_ref());
}

/// Record a persisted report.
pub fn record_report_generated(window: impl AsRef<str>, source_jobs: u64) {
    tracing::info!(
        window = %window.as_ref(),
        source_jobs = source_jobs,
        "report generated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_report_generated();
}

/// Observe the duration of a provider call.
pub fn observe_provider_call(
    provider_id: impl AsRef<str>,
    outcome: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        provider_id = %provider_id.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs = duration_secs,
        "provider call finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_provider_call(
        provider_id.as_ref(),
        outcome.as_ref(),
        duration_secs,
    );
}

/// Start timing a provider call.
pub fn record_call_start(job_id: impl AsRef<str>) -> CallTimingHandle {
    CallTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Finish timing a provider call and record its duration.
pub fn record_call_end(
    handle: CallTimingHandle,
    provider_id: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    observe_provider_call(provider_id, outcome, handle.start.elapsed().as_secs_f64());
}

/// Handle for timing a provider call, from `record_call_start` to
/// `record_call_end`.
#[derive(Debug)]
pub struct CallTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl CallTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
