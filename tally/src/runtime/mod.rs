/// Runtime builder for constructing pipeline instances.
pub mod builder;
/// Recovery of abandoned and orphaned jobs.
pub mod reaper;
/// Runtime supervisor managing worker pools, the beat and the reaper.
pub mod supervisor;
/// Worker configuration and management.
pub mod worker;

pub use builder::PipelineRuntimeBuilder;
pub use reaper::{ReapSummary, Reaper};
pub use supervisor::{PipelineRuntime, ShutdownToken, process_delivery};
pub use worker::WorkerConfig;
