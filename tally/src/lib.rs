//! Tally - job execution and statistics pipeline.
//!
//! Orders produce jobs that call external providers. Jobs travel through an
//! at-least-once broker to a pool of workers; a guarded state machine in the
//! persistent store keeps every job's progress exact regardless of how often
//! its task is delivered. A periodic beat enqueues aggregation of closed time
//! windows into immutable reports.
//!
//! # Core Concepts
//!
//! - **Job**: A [`JobRecord`] moves through [`JobStatus`] via guarded
//!   transitions in [`state`]; every write is a compare-and-swap on status and
//!   version.
//!
//! - **Broker**: The [`Broker`] trait abstracts the task channel. Tasks carry a
//!   [`TaskKind`] and are routed to a [`TaskHandler`] through the
//!   [`TaskRegistry`].
//!
//! - **Store**: [`JobStore`] and [`ReportStore`] are the single source of truth.
//!
//! - **Aggregation**: [`Beat`] enqueues closed windows; [`StatAggregator`]
//!   turns the jobs of a window into a [`Report`].
//!
//! - **Runtime**: [`PipelineRuntime`] runs the worker pool, the beat and the
//!   reaper; [`JobService`] is the submission and query surface.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store and broker via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tally::*;
//!
//! let config = PipelineConfig::from_env()?;
//! let runtime = PipelineRuntimeBuilder::new(config.clone())
//!     .with_broker(Arc::new(InMemoryBroker::new(config.visibility_timeout())))
//!     .with_store(Arc::new(InMemoryStore::new()))
//!     .with_provider(Arc::new(MyProvider))
//!     .build()?;
//! runtime.start().await?;
//!
//! let job_id = runtime.service().submit_job("order-1", "acme", payload).await?;
//! ```

/// Window statistics and report generation.
///
/// [`compute_metrics`] folds jobs into a [`MetricSet`]; [`StatAggregator`]
/// persists reports; [`AggregateWindowHandler`] runs it for
/// `aggregate_window` tasks.
pub mod aggregator;

/// Periodic enqueueing of closed aggregation windows.
pub mod beat;

/// Task broker contract and backends.
///
/// The `broker` module defines the wire envelope ([`TaskEnvelope`]), the
/// [`Broker`] trait, and the in-memory and PostgreSQL implementations.
pub mod broker;

/// Configuration structures for the pipeline and persistence.
///
/// The `config` module defines [`PipelineConfig`] (with `TALLY_*`
/// environment overrides) and [`PersistenceConfig`].
pub mod config;

/// Error taxonomy.
pub mod error;

/// Event publishing and subscription system.
///
/// The `events` module provides job lifecycle events:
/// - [`JobEventPublisher`] for publishing and subscribing
/// - [`JobEvent`] and [`JobEventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// `execute_job` task handling: one provider attempt per dispatchable job.
pub mod executor;

/// Core job types.
///
/// The `job` module defines:
/// - [`JobRecord`] - the persisted unit of work
/// - [`JobId`], [`OrderId`], [`ProviderId`] - identifiers
/// - [`JobType`] - category of work
/// - [`JobStatus`] - lifecycle states and the allowed transitions
/// - [`OrderStatus`] - rollup of an order's jobs
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus collectors, behind the `metrics` feature.
pub mod metrics;

/// External provider client contract.
pub mod provider;

/// Task-kind registry and handler contract.
pub mod registry;

/// Reports and reporting windows.
pub mod report;

/// Retry ceiling and exponential backoff.
pub mod retry;

/// Runtime orchestration and worker management.
///
/// The `runtime` module provides the [`PipelineRuntime`] for managing the
/// worker pool, the beat and the reaper. Includes:
/// - [`PipelineRuntime`] - main runtime type
/// - [`PipelineRuntimeBuilder`] - wires the built-in handlers
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`Reaper`] - recovery of abandoned and orphaned jobs
/// - [`WorkerConfig`] - worker pool configuration
pub mod runtime;

/// Submission and query API.
pub mod service;

/// Job lifecycle transitions and the compare-and-swap state machine.
pub mod state;

/// Persistent store contract and backends.
pub mod store;

/// Tracing spans and activity recording.
pub mod telemetry;

pub use aggregator::*;
pub use beat::*;
pub use broker::{
    Broker, BrokerSnapshot, BrokerSnapshotEntry, Delivery, InMemoryBroker, TaskEnvelope,
    TaskId, TaskKind, TaskTarget,
};
#[cfg(feature = "postgres")]
pub use broker::PostgresBroker;
pub use config::*;
pub use error::*;
pub use events::*;
pub use executor::ExecuteJobHandler;
pub use job::*;
pub use provider::*;
pub use registry::*;
pub use report::*;
pub use retry::*;
pub use runtime::*;
pub use service::*;
pub use state::{Committed, StateMachine, TransitionGuard};
pub use store::{CasOutcome, InMemoryStore, JobStore, ReportStore, Store, bounded};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
