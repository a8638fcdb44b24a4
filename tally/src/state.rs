//! Job lifecycle transitions.
//!
//! Every transition is a pure function from the current [`JobRecord`] to the
//! next one. Each bumps `version` and `updated_at`; the result is only made
//! durable through [`StateMachine::commit`], which guards the write with the
//! pre-state's status and version.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProviderError, StoreError, TransitionError};
use crate::job::{JobId, JobRecord, JobStatus};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{CasOutcome, JobStore, bounded};

/// Expected pre-state of a guarded write.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransitionGuard {
    pub job_id: JobId,
    pub status: JobStatus,
    pub version: u64,
}

impl TransitionGuard {
    pub fn of(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            version: job.version,
        }
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        job.id == self.job_id
            && job.status == self.status
            && job.version == self.version
    }
}

fn advance(
    job: &JobRecord,
    to: JobStatus,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    if !job.status.can_transition_to(to) {
        return Err(TransitionError::Invalid {
            id: job.id,
            from: job.status,
            to,
        });
    }
    let mut next = job.clone();
    next.status = to;
    next.version += 1;
    next.updated_at = now;
    Ok(next)
}

/// `Pending -> Running`. Consumes one attempt and records the start time.
pub fn start(
    job: &JobRecord,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    if job.status == JobStatus::Pending && job.attempts_exhausted() {
        return Err(TransitionError::AttemptsExhausted {
            id: job.id,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
        });
    }
    let mut next = advance(job, JobStatus::Running, now)?;
    next.attempts += 1;
    next.started_at = Some(now);
    next.finished_at = None;
    next.next_attempt_at = None;
    Ok(next)
}

/// `Running -> Succeeded` with the provider's result.
pub fn succeed(
    job: &JobRecord,
    result: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    let mut next = advance(job, JobStatus::Succeeded, now)?;
    next.result = Some(result);
    next.last_error = None;
    next.finished_at = Some(now);
    Ok(next)
}

/// `Running -> Retrying` or `Running -> Failed` after a provider error.
///
/// Retrying sets `next_attempt_at` to the backoff deadline.
pub fn fail_attempt(
    job: &JobRecord,
    error: &ProviderError,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    let decision = if error.is_retryable() {
        policy.decide(job.attempts, job.max_attempts)
    } else {
        RetryDecision::Exhausted
    };

    match decision {
        RetryDecision::Retry { delay } => {
            let mut next = advance(job, JobStatus::Retrying, now)?;
            next.last_error = Some(error.message().to_string());
            next.finished_at = Some(now);
            next.next_attempt_at = Some(now + delay);
            Ok(next)
        }
        RetryDecision::Exhausted => {
            let mut next = advance(job, JobStatus::Failed, now)?;
            next.last_error = Some(if error.is_retryable() {
                format!(
                    "attempts exhausted ({}/{}): {}",
                    job.attempts,
                    job.max_attempts,
                    error.message()
                )
            } else {
                error.message().to_string()
            });
            next.finished_at = Some(now);
            next.next_attempt_at = None;
            Ok(next)
        }
    }
}

/// `Retrying -> Pending` once the backoff has elapsed.
pub fn requeue(
    job: &JobRecord,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    let mut next = advance(job, JobStatus::Pending, now)?;
    next.next_attempt_at = None;
    Ok(next)
}

/// Any non-terminal status `-> Cancelled`.
pub fn cancel(
    job: &JobRecord,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    let mut next = advance(job, JobStatus::Cancelled, now)?;
    next.cancel_requested = true;
    next.finished_at = Some(now);
    next.next_attempt_at = None;
    Ok(next)
}

/// Flag a running job for cancellation without changing its status.
///
/// The version bump makes the in-flight worker's final write stale.
pub fn request_cancel(
    job: &JobRecord,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    if job.status != JobStatus::Running {
        return Err(TransitionError::Invalid {
            id: job.id,
            from: job.status,
            to: JobStatus::Cancelled,
        });
    }
    let mut next = job.clone();
    next.cancel_requested = true;
    next.version += 1;
    next.updated_at = now;
    Ok(next)
}

/// Bump `version` and `updated_at` without changing anything else.
///
/// Marks a waiting job as freshly re-enqueued so recovery sweeps skip it
/// until it goes stale again.
pub fn touch(job: &JobRecord, now: DateTime<Utc>) -> JobRecord {
    let mut next = job.clone();
    next.version += 1;
    next.updated_at = now;
    next
}

/// Recover a job left `Running` by a worker that never reported back.
///
/// The lost attempt counts; the job retries if attempts remain and fails
/// otherwise.
pub fn abandon(
    job: &JobRecord,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<JobRecord, TransitionError> {
    let message = format!(
        "attempt {} abandoned: no outcome reported since {}",
        job.attempts,
        job.started_at.unwrap_or(job.updated_at).to_rfc3339()
    );
    fail_attempt(job, &ProviderError::Retryable(message), policy, now)
}

/// Whether a `Running` job has been running for longer than `limit`.
pub fn is_abandoned(
    job: &JobRecord,
    limit: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    job.status == JobStatus::Running
        && job.started_at.unwrap_or(job.updated_at) + limit <= now
}

/// Outcome of committing a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Committed {
    /// The new record is now durable.
    Applied(JobRecord),
    /// Another writer got there first; nothing was written.
    Stale { current: Option<JobRecord> },
}

/// Writes transitions through a [`JobStore`] with compare-and-swap.
pub struct StateMachine<S: JobStore + ?Sized> {
    store: Arc<S>,
    store_timeout: Duration,
}

impl<S: JobStore + ?Sized> Clone for StateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            store_timeout: self.store_timeout,
        }
    }
}

impl<S: JobStore + ?Sized> std::fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("store_type", &std::any::type_name::<S>())
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl<S: JobStore + ?Sized> StateMachine<S> {
    pub fn new(store: Arc<S>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub async fn load(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        bounded(self.store_timeout, self.store.get_job(id)).await
    }

    /// Persist `next` if the stored job still equals `previous`'s status and
    /// version. Stale writes are logged and dropped.
    pub async fn commit(
        &self,
        previous: &JobRecord,
        next: JobRecord,
    ) -> Result<Committed, StoreError> {
        let guard = TransitionGuard::of(previous);
        let outcome = bounded(
            self.store_timeout,
            self.store.compare_and_swap(&guard, &next),
        )
        .await?;

        match outcome {
            CasOutcome::Applied => {
                if previous.status != next.status {
                    crate::telemetry::record_transition(
                        previous.status.as_str(),
                        next.status.as_str(),
                    );
                }
                Ok(Committed::Applied(next))
            }
            CasOutcome::Stale { current } => {
                debug!(
                    job_id = %guard.job_id,
                    expected_status = %guard.status,
                    expected_version = guard.version,
                    found_status = ?current.as_ref().map(|j| j.status),
                    found_version = ?current.as_ref().map(|j| j.version),
                    "stale transition dropped"
                );
                Ok(Committed::Stale { current })
            }
        }
    }
}
