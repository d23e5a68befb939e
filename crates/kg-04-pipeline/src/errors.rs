//! # Error Types
//!
//! `Pipeline::execute` never fails; these errors come from control operations
//! (cancel, pause, resume) and from custom phase handlers and hooks.

use crate::domain::{PipelinePhase, PipelineStatus};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// No active pipeline with this id.
    #[error("pipeline not found: {0}")]
    NotFound(String),

    /// The operation does not apply in the pipeline's current status.
    #[error("pipeline {pipeline_id} is {status}, cannot {operation}")]
    InvalidStatus {
        pipeline_id: String,
        status: PipelineStatus,
        operation: &'static str,
    },

    /// A phase handler did not finish within the phase timeout.
    #[error("phase {phase} timed out after {timeout:?}")]
    PhaseTimeout {
        phase: PipelinePhase,
        timeout: Duration,
    },

    /// Paused for longer than the configured maximum.
    #[error("paused longer than {0:?}")]
    PauseExpired(Duration),

    #[error("pipeline cancelled")]
    Cancelled,

    /// A custom phase handler failed.
    #[error("phase handler failed: {0}")]
    Handler(String),

    /// A phase hook failed.
    #[error("{phase} hook failed: {message}")]
    Hook {
        phase: PipelinePhase,
        message: String,
    },
}

impl PipelineError {
    /// Handler failure from any message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
