//! Metrics, outcomes and summaries.

use crate::domain::host_function::HostFunction;
use crate::domain::value_objects::{ExecutionState, SecurityMode};
use serde::{Deserialize, Serialize};
use shared_types::Payload;
use std::collections::BTreeMap;
use std::time::Duration;

/// Invocation counters kept per instance and per exported function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub invocations: u64,
    pub fuel_consumed: u64,
    pub total_time: Duration,
    pub errors: u64,
}

impl ExecutionMetrics {
    pub(crate) fn record(&mut self, fuel: u64, elapsed: Duration, failed: bool) {
        self.invocations += 1;
        self.fuel_consumed = self.fuel_consumed.saturating_add(fuel);
        self.total_time += elapsed;
        if failed {
            self.errors += 1;
        }
    }

    /// Mean wall time per invocation.
    #[must_use]
    pub fn average_time(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            self.total_time / u32::try_from(self.invocations).unwrap_or(u32::MAX)
        }
    }
}

/// Output of one successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: Payload,
    pub fuel_consumed: u64,
    pub host_calls: u64,
    pub duration: Duration,
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub name: String,
    pub version: String,
    pub state: ExecutionState,
    pub security_mode: SecurityMode,
    pub fuel_total: u64,
    pub fuel_remaining: u64,
    pub bound_functions: Vec<HostFunction>,
    pub metrics: ExecutionMetrics,
    pub functions: BTreeMap<String, ExecutionMetrics>,
    pub last_error: Option<String>,
}

/// Point-in-time view of the whole runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSummary {
    pub active_instances: usize,
    pub total_invocations: u64,
    pub total_fuel_consumed: u64,
    pub total_errors: u64,
    pub instances: Vec<InstanceSummary>,
}

impl RuntimeSummary {
    pub(crate) fn from_instances(mut instances: Vec<InstanceSummary>) -> Self {
        instances.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.instance_id.cmp(&b.instance_id)));
        Self {
            active_instances: instances.len(),
            total_invocations: instances.iter().map(|i| i.metrics.invocations).sum(),
            total_fuel_consumed: instances.iter().map(|i| i.metrics.fuel_consumed).sum(),
            total_errors: instances.iter().map(|i| i.metrics.errors).sum(),
            instances,
        }
    }
}
