//! The seven pipeline phases and their per-phase configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A pipeline phase. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Ingestion,
    Analysis,
    Validation,
    Consensus,
    Execution,
    Propagation,
    Settlement,
}

impl PipelinePhase {
    /// Every phase, in execution order.
    pub const ALL: [PipelinePhase; 7] = [
        PipelinePhase::Ingestion,
        PipelinePhase::Analysis,
        PipelinePhase::Validation,
        PipelinePhase::Consensus,
        PipelinePhase::Execution,
        PipelinePhase::Propagation,
        PipelinePhase::Settlement,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Analysis => "analysis",
            Self::Validation => "validation",
            Self::Consensus => "consensus",
            Self::Execution => "execution",
            Self::Propagation => "propagation",
            Self::Settlement => "settlement",
        }
    }

    /// Position in the execution order, starting at 0.
    #[must_use]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Default configuration for this phase.
    #[must_use]
    pub fn default_config(&self) -> PhaseConfig {
        let secs = Duration::from_secs;
        match self {
            Self::Ingestion => PhaseConfig::new(secs(5)).required(true).parallel(false),
            Self::Analysis => PhaseConfig::new(secs(10)).required(false).parallel(true),
            Self::Validation => PhaseConfig::new(secs(5)).required(true).parallel(true),
            Self::Consensus => PhaseConfig::new(secs(10)).required(false).parallel(false),
            Self::Execution => PhaseConfig::new(secs(10)).required(true).parallel(false),
            Self::Propagation => PhaseConfig::new(secs(5)).required(false).parallel(true),
            Self::Settlement => PhaseConfig::new(secs(5)).required(true).parallel(false),
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one phase runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Disabled phases are recorded as skipped.
    pub enabled: bool,
    /// Phase deadline. Sequential phases apply it to each overlay in turn.
    pub timeout: Duration,
    /// A failing required phase halts the pipeline.
    pub required: bool,
    /// Run the phase's overlays concurrently.
    pub parallel: bool,
    /// Extra attempts for a failed overlay or handler.
    pub retries: u32,
}

impl PhaseConfig {
    /// An enabled, required, sequential phase with no retries.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            enabled: true,
            timeout,
            required: true,
            parallel: false,
            retries: 0,
        }
    }

    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    #[must_use]
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Total attempts per unit of work.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}
