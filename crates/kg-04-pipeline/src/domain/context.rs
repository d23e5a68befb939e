//! Pipeline requests and the per-run context threaded through every phase.

use super::phase::PipelinePhase;
use super::result::PhaseResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{new_id, CapabilitySet, FuelBudget, Payload, TrustLevel};
use std::collections::BTreeSet;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Input and triggering context of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub input: Payload,
    pub triggered_by: Option<String>,
    pub user_id: Option<String>,
    pub trust_level: TrustLevel,
    /// Capabilities offered to every overlay; each overlay is narrowed to
    /// what it declares.
    pub capabilities: CapabilitySet,
    /// Pipeline-wide fuel. Each overlay's default budget otherwise.
    pub fuel_budget: Option<FuelBudget>,
    pub correlation_id: Option<String>,
    /// Preset id, so a caller can cancel a run it has not seen start yet.
    pub pipeline_id: Option<String>,
    pub skip_phases: BTreeSet<PipelinePhase>,
}

impl PipelineRequest {
    /// A STANDARD-trust request with no capabilities.
    #[must_use]
    pub fn new(input: Payload) -> Self {
        Self {
            input,
            triggered_by: None,
            user_id: None,
            trust_level: TrustLevel::Standard,
            capabilities: CapabilitySet::empty(),
            fuel_budget: None,
            correlation_id: None,
            pipeline_id: None,
            skip_phases: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn triggered_by(mut self, source: impl Into<String>) -> Self {
        self.triggered_by = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_trust(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = trust_level;
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_fuel(mut self, budget: FuelBudget) -> Self {
        self.fuel_budget = Some(budget);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_pipeline_id(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    #[must_use]
    pub fn skipping(mut self, phases: impl IntoIterator<Item = PipelinePhase>) -> Self {
        self.skip_phases.extend(phases);
        self
    }
}

/// State of one run, mutated phase by phase.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub pipeline_id: String,
    /// Defaults to the pipeline id.
    pub correlation_id: String,
    pub triggered_by: Option<String>,
    pub user_id: Option<String>,
    pub trust_level: TrustLevel,
    pub capabilities: CapabilitySet,
    pub fuel_budget: Option<FuelBudget>,
    /// Accumulated output of every successful overlay so far.
    pub data: Payload,
    pub phase_results: Vec<PhaseResult>,
    pub current_phase: Option<PipelinePhase>,
    pub skip_phases: BTreeSet<PipelinePhase>,
    pub started_at: DateTime<Utc>,
    /// Cancelled when the run is cancelled; every overlay gets a child.
    pub cancellation: CancellationToken,
}

impl PipelineContext {
    /// Build the context for `request`, seeding the data map with its input.
    #[must_use]
    pub fn new(request: PipelineRequest, cancellation: CancellationToken) -> Self {
        let pipeline_id = request.pipeline_id.unwrap_or_else(new_id);
        Self {
            correlation_id: request
                .correlation_id
                .unwrap_or_else(|| pipeline_id.clone()),
            pipeline_id,
            triggered_by: request.triggered_by,
            user_id: request.user_id,
            trust_level: request.trust_level,
            capabilities: request.capabilities,
            fuel_budget: request.fuel_budget,
            data: request.input,
            phase_results: Vec::with_capacity(PipelinePhase::ALL.len()),
            current_phase: None,
            skip_phases: request.skip_phases,
            started_at: Utc::now(),
            cancellation,
        }
    }

    /// Merge `output` into the data map; later keys win.
    pub fn merge(&mut self, output: &Payload) {
        for (key, value) in output {
            self.data.insert(key.clone(), value.clone());
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Charge pipeline-wide fuel, if a budget was given.
    pub fn consume_fuel(&mut self, amount: u64) {
        if let Some(budget) = self.fuel_budget.as_mut() {
            budget.consume(amount);
        }
    }

    #[must_use]
    pub fn phase_result(&self, phase: PipelinePhase) -> Option<&PhaseResult> {
        self.phase_results.iter().find(|r| r.phase == phase)
    }
}
