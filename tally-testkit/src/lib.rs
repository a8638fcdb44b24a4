//! Fixtures and fakes for testing tally pipelines.
//!
//! - [`JobFixture`] builds [`tally::JobRecord`]s in any lifecycle state.
//! - [`MockProvider`] and [`SlowProvider`] stand in for external providers.
//! - [`FlakyStore`] wraps the in-memory store and fails on demand.
//! - [`drain`] runs queued tasks to completion without a worker pool.

pub mod harness;
pub mod job;
pub mod mock;
pub mod store;

pub use harness::*;
pub use job::*;
pub use mock::*;
pub use store::*;
