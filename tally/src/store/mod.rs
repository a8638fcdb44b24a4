//! Persistent store interface.
//!
//! The store is the only durable owner of jobs and reports. Job writes go
//! through [`JobStore::compare_and_swap`], which applies an update only when
//! the persisted status and version still match the caller's view.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::job::{JobId, JobRecord, JobStatus, OrderId};
use crate::report::Report;
use crate::state::TransitionGuard;

/// In-memory store for tests and single-process deployments.
pub mod memory;

#[cfg(feature = "postgres")]
/// PostgreSQL store.
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Result of a guarded job write.
#[derive(Clone, Debug, PartialEq)]
pub enum CasOutcome {
    Applied,
    /// The persisted record no longer matches the guard. Carries the current
    /// record, or `None` if the job does not exist.
    Stale { current: Option<JobRecord> },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly submitted job.
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Replace the job with `next` if its status and version equal `guard`.
    async fn compare_and_swap(
        &self,
        guard: &TransitionGuard,
        next: &JobRecord,
    ) -> Result<CasOutcome, StoreError>;

    async fn jobs_for_order(
        &self,
        order_id: &OrderId,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Jobs whose `updated_at` falls in `[start, end)`.
    async fn jobs_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Jobs in any of `statuses` that were last written before `cutoff`.
    async fn stale_jobs(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn insert_report(&self, report: &Report) -> Result<(), StoreError>;

    /// Reports whose window lies inside `[start, end]`, ordered by window
    /// start then generation time.
    async fn list_reports(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Report>, StoreError>;
}

/// Convenience bound for stores that hold both jobs and reports.
pub trait Store: JobStore + ReportStore {}

impl<T: JobStore + ReportStore> Store for T {}

/// Run a store call with an upper bound on how long it may block.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
