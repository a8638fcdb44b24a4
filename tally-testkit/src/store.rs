use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tally::{
    CasOutcome, InMemoryStore, JobId, JobRecord, JobStatus, JobStore, OrderId, Report,
    ReportStore, StoreError, TransitionGuard,
};

/// An [`InMemoryStore`] that can be told to fail.
///
/// `fail_next(n)` makes the next `n` calls, of any kind, return
/// [`StoreError::Unavailable`] without touching the data.
#[derive(Clone, Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failures: Arc<Mutex<usize>>,
    failed_calls: Arc<Mutex<usize>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(inner: InMemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn fail_next(&self, calls: usize) {
        *self.failures.lock() = calls;
    }

    /// Number of calls that were rejected so far.
    pub fn failed_calls(&self) -> usize {
        *self.failed_calls.lock()
    }

    fn check(&self, op: &str) -> Result<(), StoreError> {
        let mut failures = self.failures.lock();
        if *failures == 0 {
            return Ok(());
        }
        *failures -= 1;
        *self.failed_calls.lock() += 1;
        Err(StoreError::Unavailable(format!("injected failure in {op}")))
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.check("insert_job")?;
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.check("get_job")?;
        self.inner.get_job(id).await
    }

    async fn compare_and_swap(
        &self,
        guard: &TransitionGuard,
        next: &JobRecord,
    ) -> Result<CasOutcome, StoreError> {
        self.check("compare_and_swap")?;
        self.inner.compare_and_swap(guard, next).await
    }

    async fn jobs_for_order(
        &self,
        order_id: &OrderId,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.check("jobs_for_order")?;
        self.inner.jobs_for_order(order_id).await
    }

    async fn jobs_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.check("jobs_updated_between")?;
        self.inner.jobs_updated_between(start, end).await
    }

    async fn stale_jobs(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.check("stale_jobs")?;
        self.inner.stale_jobs(statuses, cutoff).await
    }
}

#[async_trait]
impl ReportStore for FlakyStore {
    async fn insert_report(&self, report: &Report) -> Result<(), StoreError> {
        self.check("insert_report")?;
        self.inner.insert_report(report).await
    }

    async fn list_reports(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Report>, StoreError> {
        self.check("list_reports")?;
        self.inner.list_reports(start, end).await
    }
}
