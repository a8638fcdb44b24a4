//! Submission and query operations used by callers outside the worker pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, warn};

use crate::broker::{Broker, TaskKind, TaskTarget};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{JobId, JobRecord, JobStatus, JobType, OrderId, OrderStatus, ProviderId};
use crate::report::{Report, sort_reports};
use crate::retry::RetryPolicy;
use crate::state::{self, Committed, StateMachine};
use crate::store::{Store, bounded};
use crate::telemetry;

/// Guarded writes `cancel_job` attempts before reporting contention.
const MAX_CANCEL_ATTEMPTS: usize = 5;

/// A job to submit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub order_id: OrderId,
    pub provider_id: ProviderId,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the configured retry ceiling for this job.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl JobSubmission {
    pub fn new(
        order_id: impl Into<OrderId>,
        provider_id: impl Into<ProviderId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            provider_id: provider_id.into(),
            job_type: JobType::default(),
            payload,
            max_attempts: None,
        }
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// What status queries return about a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl From<&JobRecord> for JobView {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            cancel_requested: job.cancel_requested,
            last_error: job.last_error.clone(),
            result: job.result.clone(),
        }
    }
}

/// Entry point for submitting jobs and reading their state and reports.
pub struct JobService<B: Broker + ?Sized, S: Store + ?Sized> {
    broker: Arc<B>,
    machine: StateMachine<S>,
    events: Arc<dyn JobEventPublisher>,
    policy: RetryPolicy,
    store_timeout: Duration,
}

impl<B: Broker + ?Sized, S: Store + ?Sized> Clone for JobService<B, S> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            machine: self.machine.clone(),
            events: Arc::clone(&self.events),
            policy: self.policy.clone(),
            store_timeout: self.store_timeout,
        }
    }
}

impl<B: Broker + ?Sized, S: Store + ?Sized> fmt::Debug for JobService<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobService")
            .field("broker_type", &std::any::type_name::<B>())
            .field("machine", &self.machine)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<B: Broker + ?Sized, S: Store + ?Sized> JobService<B, S> {
    pub fn new(
        broker: Arc<B>,
        store: Arc<S>,
        events: Arc<dyn JobEventPublisher>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            broker,
            machine: StateMachine::new(store, config.store_timeout()),
            events,
            policy: config.retry.clone(),
            store_timeout: config.store_timeout(),
        }
    }

    fn store(&self) -> &Arc<S> {
        self.machine.store()
    }

    async fn emit(&self, job: &JobRecord, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::for_job(job, payload)).await {
            tracing::error!("publish job event failed: {err}");
        }
    }

    /// Submit a `Processing` job with the configured retry ceiling.
    pub async fn submit_job(
        &self,
        order_id: impl Into<OrderId>,
        provider_id: impl Into<ProviderId>,
        payload: serde_json::Value,
    ) -> Result<JobId, PipelineError> {
        self.submit(JobSubmission::new(order_id, provider_id, payload))
            .await
    }

    /// Persist a new `Pending` job and enqueue its first execution.
    ///
    /// If the job is stored but the enqueue fails, the id is still returned;
    /// the reaper re-enqueues the orphaned job once it is older than the
    /// visibility timeout.
    pub async fn submit(&self, submission: JobSubmission) -> Result<JobId, PipelineError> {
        let span = telemetry::submit_span(
            submission.order_id.as_str(),
            submission.provider_id.as_str(),
        );
        async {
            let max_attempts = submission
                .max_attempts
                .unwrap_or(self.policy.max_attempts)
                .max(1);
            let job = JobRecord::new(
                submission.order_id,
                submission.provider_id,
                submission.job_type,
                submission.payload,
                max_attempts,
                Utc::now(),
            );
            bounded(self.store_timeout, self.store().insert_job(&job)).await?;

            if let Err(err) = self
                .broker
                .enqueue(TaskKind::EXECUTE_JOB, TaskTarget::JobId(job.id), None)
                .await
            {
                warn!(
                    job_id = %job.id,
                    "enqueue failed; job stays pending until the reaper picks it up: {err}"
                );
            }

            telemetry::record_job_submitted(job.provider_id.as_str(), job.job_type.as_str());
            self.emit(
                &job,
                JobEventPayload::Submitted {
                    job_id: job.id,
                    order_id: job.order_id.clone(),
                    provider_id: job.provider_id.clone(),
                    job_type: job.job_type,
                },
            )
            .await;
            Ok(job.id)
        }
        .instrument(span)
        .await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<JobView, PipelineError> {
        self.load(job_id).await.map(|job| JobView::from(&job))
    }

    /// The full stored record.
    pub async fn get_record(&self, job_id: JobId) -> Result<JobRecord, PipelineError> {
        self.load(job_id).await
    }

    async fn load(&self, job_id: JobId) -> Result<JobRecord, PipelineError> {
        self.machine
            .load(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))
    }

    /// Cancel a job.
    ///
    /// `Pending` and `Retrying` jobs are cancelled immediately. A `Running`
    /// job is flagged; its worker discards the provider outcome and finishes
    /// the cancellation. Terminal jobs are returned unchanged.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<JobView, PipelineError> {
        let mut job = self.load(job_id).await?;

        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let now = Utc::now();
            let next = match job.status {
                JobStatus::Pending | JobStatus::Retrying => state::cancel(&job, now)?,
                JobStatus::Running if !job.cancel_requested => {
                    state::request_cancel(&job, now)?
                }
                _ => return Ok(JobView::from(&job)),
            };

            match self.machine.commit(&job, next).await? {
                Committed::Applied(next) => {
                    if next.status == JobStatus::Cancelled {
                        info!(job_id = %next.id, "job cancelled");
                        self.emit(&next, JobEventPayload::Cancelled { job_id: next.id })
                            .await;
                    } else {
                        info!(job_id = %next.id, "cancellation requested for running job");
                    }
                    return Ok(JobView::from(&next));
                }
                Committed::Stale { current: Some(current) } => job = current,
                Committed::Stale { current: None } => {
                    return Err(PipelineError::JobNotFound(job_id));
                }
            }
        }

        Err(PipelineError::StaleTransition {
            id: job.id,
            expected: job.status,
            version: job.version,
        })
    }

    /// Every job of an order.
    pub async fn jobs_for_order(
        &self,
        order_id: &OrderId,
    ) -> Result<Vec<JobRecord>, PipelineError> {
        Ok(bounded(self.store_timeout, self.store().jobs_for_order(order_id)).await?)
    }

    /// Combined status of an order's jobs.
    pub async fn order_status(&self, order_id: &OrderId) -> Result<OrderStatus, PipelineError> {
        let statuses: Vec<_> = self
            .jobs_for_order(order_id)
            .await?
            .iter()
            .map(|job| job.status)
            .collect();
        Ok(OrderStatus::rollup(&statuses))
    }

    /// Reports whose window lies inside `[start, end]`, ordered by window
    /// start then generation time.
    pub async fn list_reports(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Report>, PipelineError> {
        if start > end {
            return Err(PipelineError::InvalidWindow { start, end });
        }
        let mut reports =
            bounded(self.store_timeout, self.store().list_reports(start, end)).await?;
        sort_reports(&mut reports);
        Ok(reports)
    }
}
