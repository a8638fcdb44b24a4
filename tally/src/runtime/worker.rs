use serde::{Deserialize, Serialize};

/// Configuration for the worker pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Prefix for worker identifiers; workers are named `{prefix}-{pid}-w{i}`.
    pub name: String,
    /// Number of concurrent workers.
    pub parallelism: usize,
    /// How long a single dequeue may block waiting for work, in milliseconds.
    pub poll_wait_ms: u64,
    /// Pause after a broker error before polling again, in milliseconds.
    pub error_backoff_ms: u64,
    /// How long shutdown waits for in-flight deliveries to settle, in
    /// milliseconds. Workers still busy after that are aborted and their
    /// tasks come back after the visibility timeout.
    pub drain_timeout_ms: u64,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the worker count.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the dequeue wait.
    pub fn with_poll_wait(mut self, ms: u64) -> Self {
        self.poll_wait_ms = ms;
        self
    }

    /// Set the error backoff.
    pub fn with_error_backoff(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn with_drain_timeout(mut self, ms: u64) -> Self {
        self.drain_timeout_ms = ms;
        self
    }

    pub fn worker_id(&self, index: usize) -> String {
        format!("{}-{}-w{}", self.name, std::process::id(), index)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "tally".to_string(),
            parallelism: 4,
            poll_wait_ms: 500,
            error_backoff_ms: 100,
            drain_timeout_ms: 30_000,
        }
    }
}
