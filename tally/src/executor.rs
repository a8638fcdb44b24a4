//! Job execution task handler.
//!
//! Each `execute_job` delivery loads the job, settles any state left behind by
//! earlier deliveries (abandoned attempts, elapsed backoff, pending
//! cancellation) and, if the job is dispatchable, runs one provider attempt.
//! Every step is a guarded write, so concurrent or repeated deliveries of the
//! same task cannot run the job twice.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{Instrument, debug, info, warn};

use crate::broker::Delivery;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, ProviderError};
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{JobId, JobRecord, JobStatus};
use crate::provider::{ProviderClient, call_with_timeout};
use crate::registry::{TaskHandler, TaskOutcome};
use crate::retry::RetryPolicy;
use crate::state::{self, Committed, StateMachine};
use crate::store::JobStore;
use crate::telemetry;

/// Guarded writes one delivery may attempt before giving the task back.
const MAX_SETTLE_STEPS: usize = 6;

/// Delay before retrying a task whose job changed underneath it.
const CONTENTION_DELAY_MS: i64 = 50;

/// Handles `execute_job` tasks.
pub struct ExecuteJobHandler<S, P>
where
    S: JobStore + ?Sized,
    P: ProviderClient + ?Sized,
{
    machine: StateMachine<S>,
    provider: Arc<P>,
    events: Arc<dyn JobEventPublisher>,
    policy: RetryPolicy,
    provider_timeout: Duration,
    abandon_after: chrono::Duration,
}

impl<S, P> fmt::Debug for ExecuteJobHandler<S, P>
where
    S: JobStore + ?Sized,
    P: ProviderClient + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteJobHandler")
            .field("machine", &self.machine)
            .field("provider_type", &std::any::type_name::<P>())
            .field("policy", &self.policy)
            .field("provider_timeout", &self.provider_timeout)
            .field("abandon_after", &self.abandon_after)
            .finish()
    }
}

impl<S, P> ExecuteJobHandler<S, P>
where
    S: JobStore + ?Sized,
    P: ProviderClient + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        provider: Arc<P>,
        events: Arc<dyn JobEventPublisher>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            machine: StateMachine::new(store, config.store_timeout()),
            provider,
            events,
            policy: config.retry.clone(),
            provider_timeout: config.provider_call_timeout(),
            abandon_after: config.abandon_after(),
        }
    }

    async fn emit(&self, job: &JobRecord, payload: JobEventPayload) {
        emit(&*self.events, job, payload).await;
    }

    /// Drive `job_id` forward as far as this delivery allows.
    pub async fn execute(&self, job_id: JobId) -> Result<TaskOutcome, PipelineError> {
        let Some(mut job) = self.machine.load(job_id).await? else {
            return Ok(TaskOutcome::discard(format!("job {job_id} not found")));
        };

        for _ in 0..MAX_SETTLE_STEPS {
            let now = Utc::now();
            let next = match job.status {
                status if status.is_terminal() => {
                    debug!(job_id = %job.id, status = %status, "job already settled; delivery is a no-op");
                    return Ok(TaskOutcome::Ack);
                }
                JobStatus::Running => {
                    if !state::is_abandoned(&job, self.abandon_after, now) {
                        let started = job.started_at.unwrap_or(job.updated_at);
                        let remaining = started + self.abandon_after - now;
                        debug!(job_id = %job.id, "job is running elsewhere; checking back later");
                        return Ok(TaskOutcome::retry(
                            remaining,
                            "job is running on another worker",
                        ));
                    }
                    state::abandon(&job, &self.policy, now)?
                }
                JobStatus::Retrying | JobStatus::Pending if job.cancel_requested => {
                    state::cancel(&job, now)?
                }
                JobStatus::Retrying => match job.next_attempt_at {
                    Some(due) if due > now => {
                        return Ok(TaskOutcome::retry(due - now, "waiting out retry backoff"));
                    }
                    _ => state::requeue(&job, now)?,
                },
                JobStatus::Pending => {
                    let running = state::start(&job, now)?;
                    match self.machine.commit(&job, running).await? {
                        Committed::Applied(running) => {
                            return self.run_attempt(running).await;
                        }
                        Committed::Stale { current: Some(current) } => {
                            job = current;
                            continue;
                        }
                        Committed::Stale { current: None } => {
                            return Ok(TaskOutcome::discard(format!(
                                "job {job_id} disappeared"
                            )));
                        }
                    }
                }
                // Terminal statuses are handled by the first arm.
                _ => return Ok(TaskOutcome::Ack),
            };

            match self.machine.commit(&job, next).await? {
                Committed::Applied(next) => {
                    let abandoned = job.status == JobStatus::Running;
                    self.announce(&next, abandoned).await;
                    job = next;
                }
                Committed::Stale { current: Some(current) } => job = current,
                Committed::Stale { current: None } => {
                    return Ok(TaskOutcome::discard(format!("job {job_id} disappeared")));
                }
            }
        }

        Ok(TaskOutcome::retry(
            chrono::Duration::milliseconds(CONTENTION_DELAY_MS),
            "job kept changing during settlement",
        ))
    }

    async fn run_attempt(&self, running: JobRecord) -> Result<TaskOutcome, PipelineError> {
        self.emit(
            &running,
            JobEventPayload::Started {
                job_id: running.id,
                attempt: running.attempts,
            },
        )
        .await;

        let span = telemetry::provider_call_span(
            running.id.to_string(),
            running.provider_id.as_str(),
            running.attempts,
        );
        let result = call_with_timeout(&*self.provider, &running, self.provider_timeout)
            .instrument(span)
            .await;

        let now = Utc::now();
        let next = match &result {
            Ok(value) => state::succeed(&running, value.clone(), now)?,
            Err(err) => state::fail_attempt(&running, err, &self.policy, now)?,
        };

        match self.machine.commit(&running, next).await? {
            Committed::Applied(next) => {
                self.announce(&next, false).await;
                Ok(self.settle(&next))
            }
            Committed::Stale { current: Some(current) } => {
                self.discard_outcome(current, result.err()).await
            }
            Committed::Stale { current: None } => Ok(TaskOutcome::discard(format!(
                "job {} disappeared during provider call",
                running.id
            ))),
        }
    }

    /// The job changed while the provider call was in flight. The outcome is
    /// dropped; a cancellation request is honoured.
    async fn discard_outcome(
        &self,
        current: JobRecord,
        error: Option<ProviderError>,
    ) -> Result<TaskOutcome, PipelineError> {
        info!(
            job_id = %current.id,
            status = %current.status,
            cancel_requested = current.cancel_requested,
            provider_error = ?error.as_ref().map(ProviderError::message),
            "job changed during provider call; discarding outcome"
        );

        if current.status == JobStatus::Running && current.cancel_requested {
            let cancelled = state::cancel(&current, Utc::now())?;
            return match self.machine.commit(&current, cancelled).await? {
                Committed::Applied(cancelled) => {
                    self.announce(&cancelled, false).await;
                    Ok(TaskOutcome::Ack)
                }
                Committed::Stale { .. } => Ok(TaskOutcome::retry(
                    chrono::Duration::milliseconds(CONTENTION_DELAY_MS),
                    "job changed while cancelling",
                )),
            };
        }
        Ok(TaskOutcome::Ack)
    }

    fn settle(&self, job: &JobRecord) -> TaskOutcome {
        match job.status {
            JobStatus::Retrying => {
                let delay = job
                    .next_attempt_at
                    .map(|due| due - Utc::now())
                    .unwrap_or_else(chrono::Duration::zero)
                    .max(chrono::Duration::zero());
                TaskOutcome::retry(
                    delay,
                    job.last_error.clone().unwrap_or_else(|| "retry scheduled".into()),
                )
            }
            _ => TaskOutcome::Ack,
        }
    }

    async fn announce(&self, next: &JobRecord, abandoned: bool) {
        announce(&*self.events, next, abandoned).await;
    }
}

async fn emit(events: &dyn JobEventPublisher, job: &JobRecord, payload: JobEventPayload) {
    if let Err(err) = events.publish(JobEvent::for_job(job, payload)).await {
        tracing::error!("publish job event failed: {err}");
    }
}

/// Log and publish a committed transition. `abandoned` marks a transition
/// out of `Running` that recovered a lost attempt.
pub(crate) async fn announce(
    events: &dyn JobEventPublisher,
    next: &JobRecord,
    abandoned: bool,
) {
    if abandoned {
        telemetry::record_job_abandoned(next.id.to_string(), next.provider_id.as_str());
        emit(
            events,
            next,
            JobEventPayload::Abandoned {
                job_id: next.id,
                attempt: next.attempts,
            },
        )
        .await;
    }
    if next.status == JobStatus::Pending {
        debug!(job_id = %next.id, "backoff elapsed; job requeued");
    }
    if let Some(payload) = outcome_payload(next) {
        emit(events, next, payload).await;
    }
}

fn outcome_payload(job: &JobRecord) -> Option<JobEventPayload> {
    let error = job.last_error.clone().unwrap_or_default();
    match job.status {
        JobStatus::Succeeded => {
            info!(job_id = %job.id, attempts = job.attempts, "job succeeded");
            Some(JobEventPayload::Succeeded {
                job_id: job.id,
                attempts: job.attempts,
            })
        }
        JobStatus::Retrying => {
            let delay_ms = job
                .next_attempt_at
                .map(|due| (due - job.updated_at).num_milliseconds())
                .unwrap_or_default();
            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms,
                error = %error,
                "job attempt failed; retry scheduled"
            );
            Some(JobEventPayload::RetryScheduled {
                job_id: job.id,
                attempt: job.attempts,
                delay_ms,
                error,
            })
        }
        JobStatus::Failed => {
            warn!(job_id = %job.id, attempts = job.attempts, error = %error, "job failed");
            Some(JobEventPayload::Failed {
                job_id: job.id,
                attempts: job.attempts,
                error,
            })
        }
        JobStatus::Cancelled => {
            info!(job_id = %job.id, "job cancelled");
            Some(JobEventPayload::Cancelled { job_id: job.id })
        }
        JobStatus::Pending | JobStatus::Running => None,
    }
}

#[async_trait]
impl<S, P> TaskHandler for ExecuteJobHandler<S, P>
where
    S: JobStore + ?Sized + 'static,
    P: ProviderClient + ?Sized + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> TaskOutcome {
        let Some(job_id) = delivery.envelope.target.job_id() else {
            return TaskOutcome::discard("execute_job task carries no job id");
        };

        match self.execute(job_id).await {
            Ok(outcome) => outcome,
            Err(PipelineError::StoreUnavailable(err)) => {
                let delay = self.policy.backoff(delivery.envelope.attempt.max(1));
                warn!(
                    job_id = %job_id,
                    attempt = delivery.envelope.attempt,
                    "store unavailable; task will be retried: {err}"
                );
                TaskOutcome::retry(delay, err.to_string())
            }
            Err(err) => TaskOutcome::discard(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::job::JobType;
    use crate::store::InMemoryStore;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Scripted(Mutex<VecDeque<Result<serde_json::Value, ProviderError>>>);

    impl Scripted {
        fn new(
            outcomes: impl IntoIterator<Item = Result<serde_json::Value, ProviderError>>,
        ) -> Arc<Self> {
            Arc::new(Self(Mutex::new(outcomes.into_iter().collect())))
        }
    }

    #[async_trait]
    impl ProviderClient for Scripted {
        async fn call(
            &self,
            _job: &JobRecord,
        ) -> Result<serde_json::Value, ProviderError> {
            self.0
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::permanent("script exhausted")))
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base_ms: 0,
                backoff_cap_ms: 0,
            },
            ..Default::default()
        }
    }

    async fn seeded(store: &InMemoryStore, max_attempts: u32) -> JobRecord {
        let job = JobRecord::new(
            "order-1".into(),
            "acme".into(),
            JobType::Processing,
            serde_json::json!({"sku": "A-1"}),
            max_attempts,
            Utc::now(),
        );
        store.insert_job(&job).await.unwrap();
        job
    }

    fn handler(
        store: &InMemoryStore,
        provider: Arc<Scripted>,
    ) -> ExecuteJobHandler<InMemoryStore, Scripted> {
        ExecuteJobHandler::new(
            Arc::new(store.clone()),
            provider,
            Arc::new(InProcEventBus::new(64)),
            &config(),
        )
    }

    #[tokio::test]
    async fn success_persists_result() {
        let store = InMemoryStore::new();
        let job = seeded(&store, 3).await;
        let handler = handler(&store, Scripted::new([Ok(serde_json::json!({"tracking": "Z1"}))]));

        assert_eq!(handler.execute(job.id).await.unwrap(), TaskOutcome::Ack);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.result, Some(serde_json::json!({"tracking": "Z1"})));
    }

    #[tokio::test]
    async fn retryable_failure_returns_retry_then_succeeds() {
        let store = InMemoryStore::new();
        let job = seeded(&store, 3).await;
        let handler = handler(
            &store,
            Scripted::new([
                Err(ProviderError::retryable("503")),
                Ok(serde_json::json!("done")),
            ]),
        );

        let first = handler.execute(job.id).await.unwrap();
        assert_eq!(first.label(), "retry");
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);

        assert_eq!(handler.execute(job.id).await.unwrap(), TaskOutcome::Ack);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn redelivery_after_terminal_is_noop() {
        let store = InMemoryStore::new();
        let job = seeded(&store, 3).await;
        let handler = handler(&store, Scripted::new([Err(ProviderError::permanent("bad"))]));

        assert_eq!(handler.execute(job.id).await.unwrap(), TaskOutcome::Ack);
        let before = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(before.status, JobStatus::Failed);

        assert_eq!(handler.execute(job.id).await.unwrap(), TaskOutcome::Ack);
        let after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn running_job_held_elsewhere_is_left_alone() {
        let store = InMemoryStore::new();
        let job = seeded(&store, 3).await;
        let running = state::start(&job, Utc::now()).unwrap();
        store.put_job(running.clone());

        let handler = handler(&store, Scripted::new([]));
        assert_eq!(handler.execute(job.id).await.unwrap().label(), "retry");
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap(), running);
    }

    #[tokio::test]
    async fn abandoned_running_job_is_recovered() {
        let store = InMemoryStore::new();
        let job = seeded(&store, 3).await;
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        let running = state::start(&job, long_ago).unwrap();
        store.put_job(running);

        let handler = handler(&store, Scripted::new([Ok(serde_json::json!(1))]));
        // First pass abandons the lost attempt and waits out the (zero) backoff
        let mut outcome = handler.execute(job.id).await.unwrap();
        while outcome.label() == "retry" {
            outcome = handler.execute(job.id).await.unwrap();
        }

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn missing_job_is_discarded() {
        let store = InMemoryStore::new();
        let handler = handler(&store, Scripted::new([]));
        assert_eq!(handler.execute(JobId::new()).await.unwrap().label(), "drop");
    }
}
