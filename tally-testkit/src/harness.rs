use std::time::Duration;
use tally::{Broker, PipelineRuntime, Store, TaskOutcome};

const DRAIN_WORKER: &str = "testkit-drain";

/// Process tasks on the calling task until nothing becomes visible within
/// `idle_wait`. Returns the outcomes in processing order.
///
/// `idle_wait` should exceed the longest retry backoff the test expects, or
/// delayed tasks will be left in the broker.
pub async fn drain<B, S>(
    runtime: &PipelineRuntime<B, S>,
    idle_wait: Duration,
) -> anyhow::Result<Vec<TaskOutcome>>
where
    B: Broker + 'static,
    S: Store + 'static,
{
    let mut outcomes = Vec::new();
    while let Some(outcome) = runtime.process_next(DRAIN_WORKER, idle_wait).await? {
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Count outcomes by label (`ack`, `retry`, `drop`).
pub fn count_outcomes(outcomes: &[TaskOutcome], label: &str) -> usize {
    outcomes.iter().filter(|o| o.label() == label).count()
}
