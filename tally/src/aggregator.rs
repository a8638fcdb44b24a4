//! Window statistics.
//!
//! [`compute_metrics`] folds a set of jobs into a [`MetricSet`] in one pass.
//! [`StatAggregator`] reads the jobs last updated inside a window, computes
//! the metrics and persists a new [`Report`]. Reports are never deduplicated;
//! re-running a window over unchanged jobs yields the same metrics under a new
//! report id.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{Instrument, error, warn};

use crate::broker::Delivery;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::{JobEvent, JobEventPublisher};
use crate::job::{JobRecord, JobStatus, JobType, ProviderId};
use crate::registry::{TaskHandler, TaskOutcome};
use crate::report::{MetricSet, Report, ReportWindow};
use crate::retry::RetryPolicy;
use crate::store::{JobStore, ReportStore, bounded};
use crate::telemetry;

/// Which jobs a report covers and which extra statistics it carries.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationPolicy {
    /// Count jobs that have not reached a terminal status.
    pub include_in_flight: bool,
    /// Duration quantiles, each in `(0, 1]`.
    pub quantiles: Vec<f64>,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            include_in_flight: false,
            quantiles: vec![0.5, 0.95, 0.99],
        }
    }
}

impl From<&PipelineConfig> for AggregationPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            include_in_flight: config.include_in_flight,
            quantiles: config.quantiles.clone(),
        }
    }
}

#[derive(Default)]
struct Tally {
    count: u64,
    succeeded: u64,
    failed: u64,
    duration_sum_ms: i64,
    duration_count: u64,
}

impl Tally {
    fn add(&mut self, job: &JobRecord, duration_ms: Option<i64>) {
        self.count += 1;
        match job.status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            _ => {}
        }
        if let Some(ms) = duration_ms {
            self.duration_sum_ms += ms;
            self.duration_count += 1;
        }
    }

    fn avg_duration_ms(&self) -> f64 {
        ratio(self.duration_sum_ms as f64, self.duration_count)
    }
}

fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

/// Metric key suffix for a quantile: `0.5` -> `p50`, `0.999` -> `p99_9`.
pub fn quantile_label(q: f64) -> String {
    let pct = format!("{:.4}", q * 100.0);
    let pct = pct.trim_end_matches('0').trim_end_matches('.');
    format!("p{}", pct.replace('.', "_"))
}

/// Median of ascending `sorted` values; the mean of the middle pair when the
/// count is even.
fn median(sorted: &[i64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2] as f64,
        _ => (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0,
    }
}

/// Nearest-rank quantile over ascending `sorted` values.
fn nearest_rank(sorted: &[i64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1] as f64
}

/// Fold `jobs` into a metric set. Returns the metrics and the number of jobs
/// they cover.
///
/// Durations are whole milliseconds from start to finish of the last attempt
/// and only succeeded jobs contribute. `duration_median_ms` averages the
/// middle pair of an even sample; the `duration_p*_ms` quantiles use nearest
/// rank. Rates and durations are 0 when nothing is counted.
pub fn compute_metrics(
    jobs: &[JobRecord],
    policy: &AggregationPolicy,
) -> (MetricSet, u64) {
    let mut total = Tally::default();
    let mut by_status: BTreeMap<JobStatus, u64> = BTreeMap::new();
    let mut by_provider: BTreeMap<&ProviderId, Tally> = BTreeMap::new();
    let mut by_type: BTreeMap<JobType, u64> = BTreeMap::new();
    let mut durations = Vec::new();

    for job in jobs {
        if !policy.include_in_flight && !job.status.is_terminal() {
            continue;
        }
        let duration_ms = (job.status == JobStatus::Succeeded)
            .then(|| job.duration_ms())
            .flatten();

        total.add(job, duration_ms);
        by_provider.entry(&job.provider_id).or_default().add(job, duration_ms);
        *by_status.entry(job.status).or_default() += 1;
        *by_type.entry(job.job_type).or_default() += 1;
        if let Some(ms) = duration_ms {
            durations.push(ms);
        }
    }
    durations.sort_unstable();

    let mut metrics = MetricSet::new();
    metrics.insert("count".into(), total.count as f64);
    metrics.insert(
        "success_rate".into(),
        ratio(total.succeeded as f64, total.count),
    );
    metrics.insert(
        "failure_rate".into(),
        ratio(total.failed as f64, total.count),
    );
    metrics.insert("duration_count".into(), total.duration_count as f64);
    metrics.insert("duration_sum_ms".into(), total.duration_sum_ms as f64);
    metrics.insert("avg_duration_ms".into(), total.avg_duration_ms());
    metrics.insert(
        "duration_min_ms".into(),
        durations.first().copied().unwrap_or_default() as f64,
    );
    metrics.insert(
        "duration_max_ms".into(),
        durations.last().copied().unwrap_or_default() as f64,
    );
    metrics.insert("duration_median_ms".into(), median(&durations));
    for q in &policy.quantiles {
        metrics.insert(
            format!("duration_{}_ms", quantile_label(*q)),
            nearest_rank(&durations, *q),
        );
    }

    for status in JobStatus::ALL {
        let count = by_status.get(&status).copied().unwrap_or_default();
        metrics.insert(format!("status.{status}.count"), count as f64);
    }
    for (provider, tally) in &by_provider {
        metrics.insert(format!("provider.{provider}.count"), tally.count as f64);
        metrics.insert(
            format!("provider.{provider}.succeeded"),
            tally.succeeded as f64,
        );
        metrics.insert(format!("provider.{provider}.failed"), tally.failed as f64);
        metrics.insert(
            format!("provider.{provider}.avg_duration_ms"),
            tally.avg_duration_ms(),
        );
    }
    for (job_type, count) in &by_type {
        metrics.insert(format!("job_type.{job_type}.count"), *count as f64);
    }

    (metrics, total.count)
}

/// Computes and persists reports.
pub struct StatAggregator<S: JobStore + ReportStore + ?Sized> {
    store: Arc<S>,
    events: Arc<dyn JobEventPublisher>,
    policy: AggregationPolicy,
    store_timeout: Duration,
}

impl<S: JobStore + ReportStore + ?Sized> fmt::Debug for StatAggregator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatAggregator")
            .field("store_type", &std::any::type_name::<S>())
            .field("policy", &self.policy)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl<S: JobStore + ReportStore + ?Sized> StatAggregator<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn JobEventPublisher>,
        policy: AggregationPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            events,
            policy,
            store_timeout,
        }
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    /// Aggregate `window` and persist the resulting report.
    pub async fn run(&self, window: ReportWindow) -> Result<Report, PipelineError> {
        let span = telemetry::aggregate_span(window.to_string());
        async {
            let jobs = bounded(
                self.store_timeout,
                self.store.jobs_updated_between(window.start(), window.end()),
            )
            .await?;

            let (metrics, source_job_count) = compute_metrics(&jobs, &self.policy);
            let report = Report::new(window, metrics, source_job_count, Utc::now());

            bounded(self.store_timeout, self.store.insert_report(&report)).await?;

            telemetry::record_report_generated(window.to_string(), source_job_count);
            if let Err(err) = self.events.publish(JobEvent::report_generated(&report)).await {
                error!("publish report event failed: {err}");
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

/// Handles `aggregate_window` tasks.
///
/// Store failures are retried with the job retry policy; after
/// `max_attempts` deliveries the task is dropped.
pub struct AggregateWindowHandler<S: JobStore + ReportStore + ?Sized> {
    aggregator: Arc<StatAggregator<S>>,
    policy: RetryPolicy,
}

impl<S: JobStore + ReportStore + ?Sized> fmt::Debug for AggregateWindowHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateWindowHandler")
            .field("aggregator", &self.aggregator)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<S: JobStore + ReportStore + ?Sized> AggregateWindowHandler<S> {
    pub fn new(aggregator: Arc<StatAggregator<S>>, policy: RetryPolicy) -> Self {
        Self { aggregator, policy }
    }
}

#[async_trait]
impl<S: JobStore + ReportStore + ?Sized + 'static> TaskHandler for AggregateWindowHandler<S> {
    async fn handle(&self, delivery: &Delivery) -> TaskOutcome {
        let Some(window) = delivery.envelope.target.window() else {
            return TaskOutcome::discard("aggregate_window task carries no window");
        };

        match self.aggregator.run(window).await {
            Ok(_) => TaskOutcome::Ack,
            Err(err) => {
                let attempt = delivery.envelope.attempt.max(1);
                if attempt >= self.policy.max_attempts {
                    error!(
                        window = %window,
                        attempt,
                        "aggregation failed, giving up: {err}"
                    );
                    TaskOutcome::discard(format!(
                        "aggregation of {window} failed after {attempt} attempts: {err}"
                    ))
                } else {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        window = %window,
                        attempt,
                        delay_ms = delay.num_milliseconds(),
                        "aggregation failed, will retry: {err}"
                    );
                    TaskOutcome::retry(delay, err.to_string())
                }
            }
        }
    }
}
