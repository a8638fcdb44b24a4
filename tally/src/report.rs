use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReportId(pub Uuid);

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open reporting window `[start, end)`.
///
/// Deserialization runs the same ordering check as [`ReportWindow::new`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WindowBounds")]
pub struct ReportWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WindowBounds {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<WindowBounds> for ReportWindow {
    type Error = PipelineError;

    fn try_from(bounds: WindowBounds) -> Result<Self, Self::Error> {
        Self::new(bounds.start, bounds.end)
    }
}

impl ReportWindow {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        if start >= end {
            return Err(PipelineError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window whose bounds are known to be ordered.
    pub(crate) fn from_aligned(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start < end);
        Self { start, end }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Whether this window lies entirely inside `[start, end]`.
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start >= start && self.end <= end
    }
}

impl fmt::Display for ReportWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Metric name to value. Ordered so two reports over the same data compare
/// and serialize identically.
pub type MetricSet = BTreeMap<String, f64>;

/// Immutable result of aggregating one window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub window: ReportWindow,
    pub metrics: MetricSet,
    pub generated_at: DateTime<Utc>,
    pub source_job_count: u64,
}

impl Report {
    pub fn new(
        window: ReportWindow,
        metrics: MetricSet,
        source_job_count: u64,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReportId::new(),
            window,
            metrics,
            generated_at,
            source_job_count,
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Ordering used by report listings: window start, then generation time.
pub fn sort_reports(reports: &mut [Report]) {
    reports.sort_by(|a, b| {
        a.window
            .start()
            .cmp(&b.window.start())
            .then(a.generated_at.cmp(&b.generated_at))
    });
}

/// Keeps only the most recently generated report for each window.
pub fn latest_per_window(reports: &[Report]) -> Vec<Report> {
    let mut latest: BTreeMap<(DateTime<Utc>, DateTime<Utc>), &Report> =
        BTreeMap::new();
    for report in reports {
        let key = (report.window.start(), report.window.end());
        match latest.get(&key) {
            Some(existing) if existing.generated_at >= report.generated_at => {}
            _ => {
                latest.insert(key, report);
            }
        }
    }
    latest.into_values().cloned().collect()
}
