//! # Fuel Budget
//!
//! Resource quota for one execution context. Fuel is an abstract compute unit;
//! the memory ceiling and wall-clock timeout travel with it.
//!
//! ## Invariants
//!
//! - `consumed <= total` (consumption is clamped)
//! - `consumed` never decreases
//! - once `remaining() == 0` the budget is exhausted for good

use crate::errors::TypeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default fuel granted to a fresh budget.
pub const DEFAULT_TOTAL_FUEL: u64 = 1_000_000;

/// Default memory ceiling in megabytes.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;

/// Default wall-clock timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A consumable resource quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuelBudget {
    total_fuel: u64,
    consumed_fuel: u64,
    /// Memory ceiling in megabytes.
    pub memory_limit_mb: u64,
    /// Wall-clock ceiling for one execution.
    pub timeout: Duration,
}

impl FuelBudget {
    /// Create a budget with the default memory ceiling.
    #[must_use]
    pub fn new(total_fuel: u64, timeout: Duration) -> Self {
        Self {
            total_fuel,
            consumed_fuel: 0,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            timeout,
        }
    }

    /// Create a budget, rejecting degenerate values.
    pub fn try_new(
        total_fuel: u64,
        memory_limit_mb: u64,
        timeout: Duration,
    ) -> Result<Self, TypeError> {
        if total_fuel == 0 {
            return Err(TypeError::InvalidFuelBudget("total fuel is zero".into()));
        }
        if timeout.is_zero() {
            return Err(TypeError::InvalidFuelBudget("timeout is zero".into()));
        }
        Ok(Self {
            total_fuel,
            consumed_fuel: 0,
            memory_limit_mb,
            timeout,
        })
    }

    /// Builder-style memory ceiling.
    #[must_use]
    pub fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    /// Total fuel granted.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total_fuel
    }

    /// Fuel consumed so far.
    #[must_use]
    pub const fn consumed(&self) -> u64 {
        self.consumed_fuel
    }

    /// Fuel left.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.total_fuel.saturating_sub(self.consumed_fuel)
    }

    /// Returns true if no fuel is left.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns true if `amount` could be consumed without clamping.
    #[must_use]
    pub const fn can_afford(&self, amount: u64) -> bool {
        amount <= self.remaining()
    }

    /// Memory ceiling in bytes.
    #[must_use]
    pub const fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    /// Deduct fuel, clamped at the total. Returns the amount actually deducted.
    pub fn consume(&mut self, amount: u64) -> u64 {
        let deducted = amount.min(self.remaining());
        self.consumed_fuel = self.consumed_fuel.saturating_add(deducted);
        deducted
    }

    /// A fresh budget with the same limits and nothing consumed.
    #[must_use]
    pub fn refilled(&self) -> Self {
        Self {
            consumed_fuel: 0,
            ..self.clone()
        }
    }
}

impl Default for FuelBudget {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_FUEL, DEFAULT_TIMEOUT)
    }
}
