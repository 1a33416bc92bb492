//! Application Layer - Use cases
//!
//! - Batch orchestration: cache, coalesce, batch, rate-limit and retry provider fetches
//! - Pipeline: one discovery cycle through the quick, medium and full gates
//! - Scheduler: the adaptive polling loop around the pipeline

pub mod batch_orchestrator;
pub mod pipeline;
pub mod scheduler;

pub use batch_orchestrator::{
    BatchRequestOrchestrator, FetchOutput, FetchReport, FetchRequest, KeyOutcome, RetryPolicy,
};
pub use pipeline::{
    CandidateTrace, CycleReport, FetchSpec, PipelineConfig, PipelineError, ProgressiveFilterPipeline,
};
pub use scheduler::{AdaptiveScheduler, CycleOutcome, SchedulerStatus};
