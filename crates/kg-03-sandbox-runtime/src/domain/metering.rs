//! # Fuel Metering
//!
//! Fuel is derived after the fact from wall time plus a fixed charge per host
//! call. It bounds cost, not isolation: a hot loop that never yields is only
//! stopped by the call deadline.

use crate::domain::value_objects::SandboxConfig;
use crate::errors::SandboxError;
use shared_types::FuelBudget;
use std::time::Duration;

/// Metering rates taken from [`SandboxConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuelMeter {
    pub fuel_per_ms: u64,
    pub host_call_cost: u64,
}

impl FuelMeter {
    #[must_use]
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            fuel_per_ms: config.fuel_per_ms,
            host_call_cost: config.host_call_cost,
        }
    }

    /// Fuel used by a call that ran for `elapsed` and made `host_calls`.
    #[must_use]
    pub fn consumption(&self, elapsed: Duration, host_calls: u64) -> u64 {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        millis
            .saturating_mul(self.fuel_per_ms)
            .saturating_add(host_calls.saturating_mul(self.host_call_cost))
    }

    /// The most one call may use: its ceiling, capped by what is left.
    ///
    /// Fails when the budget cannot cover the ceiling.
    pub fn allowance(&self, budget: &FuelBudget, ceiling: u64) -> Result<u64, SandboxError> {
        if budget.is_exhausted() || !budget.can_afford(ceiling) {
            return Err(SandboxError::FuelExhausted {
                required: ceiling,
                remaining: budget.remaining(),
            });
        }
        Ok(ceiling)
    }

    /// Charge a finished call against `budget`.
    ///
    /// Returns the fuel deducted, or `FuelExhausted` after deducting the whole
    /// allowance when the call overran it.
    pub fn settle(
        &self,
        budget: &mut FuelBudget,
        allowance: u64,
        used: u64,
    ) -> Result<u64, (u64, SandboxError)> {
        if used > allowance {
            let deducted = budget.consume(allowance);
            return Err((
                deducted,
                SandboxError::FuelExhausted {
                    required: used,
                    remaining: budget.remaining(),
                },
            ));
        }
        Ok(budget.consume(used))
    }
}
