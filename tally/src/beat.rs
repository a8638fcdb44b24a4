//! Periodic enqueueing of aggregation work.
//!
//! Windows are aligned to the Unix epoch: with a 24 hour window every report
//! covers one UTC day. Each tick enqueues the most recently closed window
//! unless this beat already enqueued it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use tracing::{Instrument, debug, info};

use crate::broker::{Broker, TaskId, TaskKind, TaskTarget};
use crate::report::ReportWindow;
use crate::telemetry;

/// The most recent window of `window_hours` that ended at or before `now`.
pub fn closed_window(now: DateTime<Utc>, window_hours: u32) -> ReportWindow {
    let length = i64::from(window_hours.max(1)) * 3600;
    let end_secs = now.timestamp().div_euclid(length) * length;
    let end = Utc.timestamp_opt(end_secs, 0).single().unwrap_or(now);
    ReportWindow::from_aligned(end - Duration::seconds(length), end)
}

/// Enqueues one `aggregate_window` task per closed window.
pub struct Beat<B: Broker + ?Sized> {
    broker: Arc<B>,
    window_hours: u32,
    last_enqueued: Mutex<Option<ReportWindow>>,
}

impl<B: Broker + ?Sized> fmt::Debug for Beat<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beat")
            .field("broker_type", &std::any::type_name::<B>())
            .field("window_hours", &self.window_hours)
            .field("last_enqueued", &*self.last_enqueued.lock())
            .finish()
    }
}

impl<B: Broker + ?Sized> Beat<B> {
    pub fn new(broker: Arc<B>, window_hours: u32) -> Self {
        Self {
            broker,
            window_hours,
            last_enqueued: Mutex::new(None),
        }
    }

    pub fn last_enqueued(&self) -> Option<ReportWindow> {
        *self.last_enqueued.lock()
    }

    /// Enqueue the window that closed most recently before `now`, if it has
    /// not been enqueued by this beat yet.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<Option<TaskId>> {
        let window = closed_window(now, self.window_hours);
        async {
            if self.last_enqueued() == Some(window) {
                debug!(window = %window, "window already enqueued");
                return Ok(None);
            }

            let task_id = self
                .broker
                .enqueue(
                    TaskKind::AGGREGATE_WINDOW,
                    TaskTarget::WindowSpec(window),
                    None,
                )
                .await?;
            *self.last_enqueued.lock() = Some(window);
            info!(window = %window, task_id = %task_id, "aggregation enqueued");
            Ok(Some(task_id))
        }
        .instrument(telemetry::beat_span())
        .await
    }
}
