//! Execution requests, results and manager statistics.

use chrono::{DateTime, Utc};
use kg_01_overlay_contract::{ErrorKind, OverlayError};
use serde::{Deserialize, Serialize};
use shared_bus::Event;
use shared_types::{new_id, CapabilitySet, FuelBudget, OverlayState, Payload, TrustLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::CircuitState;

/// One invocation of an overlay.
#[derive(Debug, Clone)]
pub struct OverlayExecutionRequest {
    /// Direct input data.
    pub input: Payload,
    /// Triggering event, for event-driven executions.
    pub event: Option<Arc<Event>>,
    /// Caller trust.
    pub trust_level: TrustLevel,
    /// Requested capabilities; narrowed to the overlay's declared set.
    pub capabilities: CapabilitySet,
    /// Budget; the overlay's default when `None`.
    pub fuel_budget: Option<FuelBudget>,
    pub correlation_id: Option<String>,
    pub triggered_by: Option<String>,
    pub user_id: Option<String>,
    /// Parent cancellation; the execution gets a child token.
    pub cancellation: Option<CancellationToken>,
}

impl OverlayExecutionRequest {
    /// Direct invocation at STANDARD trust with no capabilities.
    #[must_use]
    pub fn new(input: Payload) -> Self {
        Self {
            input,
            event: None,
            trust_level: TrustLevel::Standard,
            capabilities: CapabilitySet::empty(),
            fuel_budget: None,
            correlation_id: None,
            triggered_by: None,
            user_id: None,
            cancellation: None,
        }
    }

    /// Event-driven invocation. Input is the event payload.
    #[must_use]
    pub fn for_event(event: Arc<Event>) -> Self {
        let mut request = Self::new(event.payload.clone());
        request.correlation_id = event.correlation_id.clone();
        request.triggered_by = Some(event.source.clone());
        request.event = Some(event);
        request
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
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, triggered_by: impl Into<String>) -> Self {
        self.triggered_by = Some(triggered_by.into());
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Outcome of one invocation, as kept in the execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayExecutionResult {
    pub execution_id: String,
    pub overlay_id: String,
    pub overlay_name: String,
    pub success: bool,
    pub data: Payload,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Ids of the events published on the overlay's behalf.
    pub events_emitted: Vec<String>,
    pub duration: Duration,
    pub fuel_consumed: u64,
    pub correlation_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl OverlayExecutionResult {
    /// A failure that never reached the overlay.
    pub(crate) fn rejected(
        overlay_id: &str,
        overlay_name: &str,
        correlation_id: Option<String>,
        error: &OverlayError,
    ) -> Self {
        Self {
            execution_id: new_id(),
            overlay_id: overlay_id.to_string(),
            overlay_name: overlay_name.to_string(),
            success: false,
            data: Payload::new(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            events_emitted: Vec::new(),
            duration: Duration::ZERO,
            fuel_consumed: 0,
            correlation_id,
            started_at: Utc::now(),
        }
    }

    /// Returns true if this was a fast-fail from an open circuit.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        self.error_kind == Some(ErrorKind::CircuitOpen)
    }
}

/// Registry listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: OverlayState,
    pub circuit: CircuitState,
}

/// Manager-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub registered_overlays: usize,
    pub active_overlays: usize,
    pub open_circuits: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub circuit_rejections: u64,
    pub history_size: usize,
}
