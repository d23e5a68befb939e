//! # Domain
//!
//! Phases, per-run context and results. No scheduling logic.

pub mod context;
pub mod phase;
pub mod result;

pub use context::{PipelineContext, PipelineRequest, PipelineStatus};
pub use phase::{PhaseConfig, PhaseStatus, PipelinePhase};
pub use result::{ActivePipeline, PhaseResult, PipelineResult, PipelineStats};
