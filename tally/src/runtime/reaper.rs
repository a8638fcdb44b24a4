use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, info, warn};

use crate::broker::{Broker, TaskKind, TaskTarget};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::JobEventPublisher;
use crate::executor::announce;
use crate::job::{JobRecord, JobStatus};
use crate::retry::RetryPolicy;
use crate::state::{self, Committed, StateMachine};
use crate::store::{JobStore, bounded};
use crate::telemetry;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReapSummary {
    /// Running jobs whose attempt was written off.
    pub abandoned: usize,
    /// Pending or retrying jobs that got a fresh execution task.
    pub requeued: usize,
}

/// Finds jobs that no task will move forward and gets them going again.
///
/// A `Running` job whose worker went silent for longer than `abandon_after`
/// has its attempt written off. A `Pending` or `Retrying` job untouched for
/// longer than the visibility timeout and with no task left in the broker is
/// re-enqueued. The re-enqueue is recorded on the job with a guarded write, so
/// it happens at most once per threshold even with several reapers running.
pub struct Reaper<B: Broker + ?Sized, S: JobStore + ?Sized> {
    broker: Arc<B>,
    machine: StateMachine<S>,
    events: Arc<dyn JobEventPublisher>,
    policy: RetryPolicy,
    abandon_after: chrono::Duration,
    orphan_after: chrono::Duration,
}

impl<B: Broker + ?Sized, S: JobStore + ?Sized> fmt::Debug for Reaper<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaper")
            .field("broker_type", &std::any::type_name::<B>())
            .field("machine", &self.machine)
            .field("abandon_after", &self.abandon_after)
            .field("orphan_after", &self.orphan_after)
            .finish()
    }
}

impl<B: Broker + ?Sized, S: JobStore + ?Sized> Reaper<B, S> {
    pub fn new(
        broker: Arc<B>,
        store: Arc<S>,
        events: Arc<dyn JobEventPublisher>,
        config: &PipelineConfig,
    ) -> Self {
        let orphan_after = chrono::Duration::from_std(config.visibility_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            broker,
            machine: StateMachine::new(store, config.store_timeout()),
            events,
            policy: config.retry.clone(),
            abandon_after: config.abandon_after(),
            orphan_after,
        }
    }

    /// One pass over the store as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ReapSummary, PipelineError> {
        async {
            let mut summary = ReapSummary::default();
            let store = self.machine.store();
            let timeout = self.machine.store_timeout();

            let running = bounded(
                timeout,
                store.stale_jobs(&[JobStatus::Running], now - self.abandon_after),
            )
            .await?;
            for job in running {
                if !state::is_abandoned(&job, self.abandon_after, now) {
                    continue;
                }
                if self.abandon(job, now).await? {
                    summary.abandoned += 1;
                }
            }

            let waiting = bounded(
                timeout,
                store.stale_jobs(
                    &[JobStatus::Pending, JobStatus::Retrying],
                    now - self.orphan_after,
                ),
            )
            .await?;
            for job in waiting {
                let due = match job.status {
                    JobStatus::Retrying => job.next_attempt_at.unwrap_or(job.updated_at),
                    _ => job.updated_at,
                };
                if due + self.orphan_after > now {
                    continue;
                }
                if self.requeue_orphan(job, now).await? {
                    summary.requeued += 1;
                }
            }

            if summary != ReapSummary::default() {
                info!(
                    abandoned = summary.abandoned,
                    requeued = summary.requeued,
                    "reaper sweep recovered jobs"
                );
            }
            Ok(summary)
        }
        .instrument(telemetry::reap_span())
        .await
    }

    async fn abandon(&self, job: JobRecord, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let next = state::abandon(&job, &self.policy, now)?;
        match self.machine.commit(&job, next).await? {
            Committed::Applied(next) => {
                announce(&*self.events, &next, true).await;
                if next.status == JobStatus::Retrying {
                    self.enqueue(&next).await?;
                }
                Ok(true)
            }
            Committed::Stale { .. } => Ok(false),
        }
    }

    /// Re-enqueue a waiting job that has no task left in the broker.
    ///
    /// The job is touched first; only the sweep whose guarded write lands
    /// enqueues, and the fresh `updated_at` keeps later sweeps off it until
    /// the orphan threshold passes again.
    async fn requeue_orphan(&self, job: JobRecord, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let target = TaskTarget::JobId(job.id);
        let queued = self
            .broker
            .has_task(&TaskKind::EXECUTE_JOB, &target)
            .await
            .map_err(PipelineError::Broker)?;
        if queued {
            debug!(job_id = %job.id, "stale job still has a queued task");
            return Ok(false);
        }

        let touched = state::touch(&job, now);
        match self.machine.commit(&job, touched).await? {
            Committed::Applied(touched) => {
                debug!(job_id = %touched.id, status = %touched.status, "re-enqueueing orphaned job");
                self.enqueue(&touched).await?;
                Ok(true)
            }
            Committed::Stale { .. } => Ok(false),
        }
    }

    /// A failed enqueue aborts the sweep. The job was already touched, so the
    /// next sweep past the orphan threshold picks it up again.
    async fn enqueue(&self, job: &JobRecord) -> Result<(), PipelineError> {
        let not_before = match job.status {
            JobStatus::Retrying => job.next_attempt_at,
            _ => None,
        };
        self.broker
            .enqueue(TaskKind::EXECUTE_JOB, TaskTarget::JobId(job.id), not_before)
            .await
            .map_err(|err| {
                warn!(job_id = %job.id, "reaper enqueue failed: {err}");
                PipelineError::Broker(err)
            })?;
        Ok(())
    }
}
