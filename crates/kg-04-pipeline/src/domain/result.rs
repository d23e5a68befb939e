//! Phase and pipeline results, and scheduler statistics.

use super::context::PipelineStatus;
use super::phase::{PhaseStatus, PipelinePhase};
use chrono::{DateTime, Utc};
use kg_02_overlay_manager::OverlayExecutionResult;
use serde::{Deserialize, Serialize};
use shared_types::Payload;
use std::time::Duration;

/// What one phase did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PipelinePhase,
    pub status: PhaseStatus,
    /// Merged output of the phase's successful overlays, or the handler's output.
    pub data: Payload,
    /// Final attempt of every overlay the phase started, in registration order.
    pub overlay_results: Vec<OverlayExecutionResult>,
    pub errors: Vec<String>,
    /// Attempts made by the most-retried unit of work.
    pub attempts: u32,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PhaseResult {
    /// A phase that did not run.
    #[must_use]
    pub fn skipped(phase: PipelinePhase) -> Self {
        let now = Utc::now();
        Self {
            phase,
            status: PhaseStatus::Skipped,
            data: Payload::new(),
            overlay_results: Vec::new(),
            errors: Vec::new(),
            attempts: 0,
            duration: Duration::ZERO,
            started_at: now,
            completed_at: now,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PhaseStatus::Completed
    }

    /// Names of the overlays the phase ran.
    #[must_use]
    pub fn overlays_executed(&self) -> Vec<&str> {
        self.overlay_results
            .iter()
            .map(|r| r.overlay_name.as_str())
            .collect()
    }
}

/// The answer to one `execute` call, whatever happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline_id: String,
    pub correlation_id: String,
    pub status: PipelineStatus,
    /// One entry per phase reached, in execution order.
    pub phase_results: Vec<PhaseResult>,
    pub final_data: Payload,
    /// Required-phase failures.
    pub errors: Vec<String>,
    /// Optional-phase failures.
    pub warnings: Vec<String>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PipelineResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    #[must_use]
    pub fn phase(&self, phase: PipelinePhase) -> Option<&PhaseResult> {
        self.phase_results.iter().find(|r| r.phase == phase)
    }

    /// The phase the run stopped in, for failed or cancelled runs.
    #[must_use]
    pub fn failed_phase(&self) -> Option<PipelinePhase> {
        if self.is_success() {
            return None;
        }
        self.phase_results
            .iter()
            .rev()
            .find(|r| r.status == PhaseStatus::Failed)
            .map(|r| r.phase)
    }
}

/// A run still in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePipeline {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    pub current_phase: Option<PipelinePhase>,
    pub triggered_by: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total_runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active: usize,
    pub history_size: usize,
    /// Mean duration over the runs still in history.
    pub average_duration: Duration,
    pub registered_overlays: usize,
    pub custom_handlers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(phase: PipelinePhase, status: PhaseStatus) -> PhaseResult {
        PhaseResult {
            status,
            ..PhaseResult::skipped(phase)
        }
    }

    fn result(status: PipelineStatus, phases: Vec<PhaseResult>) -> PipelineResult {
        let now = Utc::now();
        PipelineResult {
            pipeline_id: "p".into(),
            correlation_id: "p".into(),
            status,
            phase_results: phases,
            final_data: Payload::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            duration: Duration::ZERO,
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn test_failed_phase_is_last_failure() {
        let run = result(
            PipelineStatus::Failed,
            vec![
                phase(PipelinePhase::Ingestion, PhaseStatus::Completed),
                phase(PipelinePhase::Analysis, PhaseStatus::Failed),
                phase(PipelinePhase::Validation, PhaseStatus::Failed),
            ],
        );
        assert_eq!(run.failed_phase(), Some(PipelinePhase::Validation));
        assert!(!run.is_success());
    }

    #[test]
    fn test_completed_run_has_no_failed_phase() {
        let run = result(
            PipelineStatus::Completed,
            vec![phase(PipelinePhase::Consensus, PhaseStatus::Failed)],
        );
        assert_eq!(run.failed_phase(), None);
        assert!(run.phase(PipelinePhase::Consensus).is_some());
        assert!(run.phase(PipelinePhase::Settlement).is_none());
    }
}
