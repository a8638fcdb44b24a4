use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{Delivery, TaskKind};

/// How a worker should settle a delivered task.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    /// Done (successfully or not); remove the task.
    Ack,
    /// Put the task back, visible again after `delay`.
    Retry {
        delay: chrono::Duration,
        reason: String,
    },
    /// The task cannot be processed; remove it and log why.
    Drop { reason: String },
}

impl TaskOutcome {
    pub fn retry(delay: chrono::Duration, reason: impl Into<String>) -> Self {
        Self::Retry {
            delay,
            reason: reason.into(),
        }
    }

    pub fn discard(reason: impl Into<String>) -> Self {
        Self::Drop {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Retry { .. } => "retry",
            Self::Drop { .. } => "drop",
        }
    }
}

/// Handler for one task kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> TaskOutcome;
}

/// Maps task kinds to handlers; consulted for every delivery.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(TaskKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("TaskRegistry").field("kinds", &kinds).finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous handler.
    pub fn register(
        &mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn with(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Route a delivery to its handler. Unknown kinds are dropped.
    pub async fn dispatch(&self, delivery: &Delivery) -> TaskOutcome {
        match self.handlers.get(&delivery.envelope.task_kind) {
            Some(handler) => handler.handle(delivery).await,
            None => TaskOutcome::discard(format!(
                "no handler registered for task kind {}",
                delivery.envelope.task_kind
            )),
        }
    }
}
