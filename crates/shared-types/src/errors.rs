//! # Error Types
//!
//! Errors raised while parsing or validating shared primitives.

use thiserror::Error;

/// Errors from parsing shared kernel types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    /// Capability name not in the closed set.
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// Trust level name not in the closed set.
    #[error("Unknown trust level: {0}")]
    UnknownTrustLevel(String),

    /// A fuel budget was constructed with zero total fuel or zero timeout.
    #[error("Invalid fuel budget: {0}")]
    InvalidFuelBudget(String),
}
