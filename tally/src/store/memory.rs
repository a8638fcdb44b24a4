use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CasOutcome, JobStore, ReportStore};
use crate::error::StoreError;
use crate::job::{JobId, JobRecord, JobStatus, OrderId};
use crate::report::{Report, sort_reports};
use crate::state::TransitionGuard;

/// Process-local store. Cloning shares the underlying maps.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    jobs: Arc<Mutex<HashMap<JobId, JobRecord>>>,
    reports: Arc<Mutex<Vec<Report>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().len()
    }

    /// Overwrite a job without a guard. Test and fixture use only.
    pub fn put_job(&self, job: JobRecord) {
        self.jobs.lock().insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Corrupt(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn compare_and_swap(
        &self,
        guard: &TransitionGuard,
        next: &JobRecord,
    ) -> Result<CasOutcome, StoreError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&guard.job_id) {
            Some(current) if guard.matches(current) => {
                *current = next.clone();
                Ok(CasOutcome::Applied)
            }
            Some(current) => Ok(CasOutcome::Stale {
                current: Some(current.clone()),
            }),
            None => Ok(CasOutcome::Stale { current: None }),
        }
    }

    async fn jobs_for_order(
        &self,
        order_id: &OrderId,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .values()
            .filter(|job| &job.order_id == order_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id.0));
        Ok(jobs)
    }

    async fn jobs_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .values()
            .filter(|job| job.updated_at >= start && job.updated_at < end)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.updated_at, job.id.0));
        Ok(jobs)
    }

    async fn stale_jobs(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|job| statuses.contains(&job.status) && job.updated_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReportStore for InMemoryStore {
    async fn insert_report(&self, report: &Report) -> Result<(), StoreError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }

    async fn list_reports(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Report>, StoreError> {
        let mut reports: Vec<_> = self
            .reports
            .lock()
            .iter()
            .filter(|report| report.window.within(start, end))
            .cloned()
            .collect();
        sort_reports(&mut reports);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use crate::report::{MetricSet, ReportWindow};
    use chrono::Duration;

    fn job(now: DateTime<Utc>) -> JobRecord {
        JobRecord::new(
            "order-1".into(),
            "acme".into(),
            JobType::Processing,
            serde_json::json!({"sku": 1}),
            3,
            now,
        )
    }

    #[tokio::test]
    async fn cas_applies_only_on_matching_guard() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let original = job(now);
        store.insert_job(&original).await.unwrap();

        let guard = TransitionGuard::of(&original);
        let mut next = original.clone();
        next.status = JobStatus::Running;
        next.version += 1;

        assert_eq!(
            store.compare_and_swap(&guard, &next).await.unwrap(),
            CasOutcome::Applied
        );

        // Same guard again is now stale and reports the current record
        match store.compare_and_swap(&guard, &next).await.unwrap() {
            CasOutcome::Stale { current: Some(current) } => {
                assert_eq!(current.status, JobStatus::Running);
                assert_eq!(current.version, 1);
            }
            other => panic!("expected stale outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cas_on_missing_job_is_stale() {
        let store = InMemoryStore::new();
        let record = job(Utc::now());
        let outcome = store
            .compare_and_swap(&TransitionGuard::of(&record), &record)
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Stale { current: None });
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = InMemoryStore::new();
        let record = job(Utc::now());
        store.insert_job(&record).await.unwrap();
        assert!(store.insert_job(&record).await.is_err());
    }

    #[tokio::test]
    async fn updated_between_is_half_open() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        let mut a = job(t0);
        a.updated_at = t0;
        let mut b = job(t0);
        b.updated_at = t0 + Duration::hours(1);
        store.put_job(a.clone());
        store.put_job(b);

        let found = store
            .jobs_updated_between(t0, t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
    }

    #[tokio::test]
    async fn list_reports_uses_containment() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        let inside =
            ReportWindow::new(t0, t0 + Duration::hours(1)).unwrap();
        let straddling =
            ReportWindow::new(t0 + Duration::minutes(30), t0 + Duration::hours(2))
                .unwrap();
        store
            .insert_report(&Report::new(inside, MetricSet::new(), 0, t0))
            .await
            .unwrap();
        store
            .insert_report(&Report::new(straddling, MetricSet::new(), 0, t0))
            .await
            .unwrap();

        let listed = store
            .list_reports(t0, t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].window, inside);
    }
}
