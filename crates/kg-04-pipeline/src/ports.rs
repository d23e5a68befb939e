//! # Ports
//!
//! Extension points of the scheduler: a custom handler replaces a phase's
//! default overlay fan-out; hooks observe every phase.

use crate::domain::{PhaseResult, PipelineContext, PipelinePhase};
use crate::errors::PipelineError;
use async_trait::async_trait;
use shared_types::Payload;

/// Replaces the default behaviour of one phase.
///
/// The returned payload is merged into the pipeline data. Runs under the
/// phase timeout and is retried like an overlay.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(&self, ctx: &PipelineContext) -> Result<Payload, PipelineError>;
}

/// Called around every phase that runs.
///
/// A failing `before_phase` fails the phase. A failing `after_phase` is
/// logged and ignored.
#[async_trait]
pub trait PhaseHook: Send + Sync {
    async fn before_phase(
        &self,
        _phase: PipelinePhase,
        _ctx: &PipelineContext,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn after_phase(
        &self,
        _ctx: &PipelineContext,
        _result: &PhaseResult,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}
