//! # Error Types
//!
//! Every way an overlay invocation can fail, classified by [`ErrorKind`].

use serde::{Deserialize, Serialize};
use shared_types::{Capability, OverlayState, TrustLevel};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// ERROR CLASSIFICATION
// =============================================================================

/// Coarse error class used for breaker accounting and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required capability was not granted. Fails closed.
    Capability,
    /// Fuel, memory ceiling or timeout.
    ResourceLimit,
    /// Fast-fail from an open circuit breaker.
    CircuitOpen,
    /// Invalid trust or security-mode combination.
    Security,
    /// The overlay itself failed or panicked.
    Execution,
    /// Called in a lifecycle state that does not accept work.
    InvalidState,
    /// No such overlay or instance.
    NotFound,
    /// Cooperative cancellation.
    Cancelled,
}

impl ErrorKind {
    /// Returns true if this kind is a genuine execution failure that a circuit
    /// breaker should count.
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Self::Execution | Self::ResourceLimit)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Capability => "capability",
            Self::ResourceLimit => "resource_limit",
            Self::CircuitOpen => "circuit_open",
            Self::Security => "security",
            Self::Execution => "execution",
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

// =============================================================================
// OVERLAY ERRORS
// =============================================================================

/// Errors raised by overlays and by the run wrapper around them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OverlayError {
    /// Required capabilities are missing from the grant.
    #[error("overlay {overlay} missing capabilities: {}", format_capabilities(.missing))]
    MissingCapabilities {
        /// Overlay name.
        overlay: String,
        /// Capabilities required but not granted.
        missing: Vec<Capability>,
    },

    /// Execution exceeded its deadline.
    #[error("overlay {overlay} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Overlay name.
        overlay: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// Not enough fuel left.
    #[error("fuel exhausted: required {required}, remaining {remaining}")]
    FuelExhausted {
        /// Fuel needed.
        required: u64,
        /// Fuel left.
        remaining: u64,
    },

    /// A payload exceeded the memory ceiling.
    #[error("memory limit exceeded: {size} > {limit} bytes")]
    MemoryLimitExceeded {
        /// Size in bytes.
        size: u64,
        /// Ceiling in bytes.
        limit: u64,
    },

    /// The overlay's circuit breaker is open.
    #[error("circuit open for overlay {0}")]
    CircuitOpen(String),

    /// Caller trust is below the overlay's minimum.
    #[error("trust level {actual} below required {required}")]
    InsufficientTrust {
        /// Overlay minimum.
        required: TrustLevel,
        /// Caller's level.
        actual: TrustLevel,
    },

    /// Any other security violation.
    #[error("security violation: {0}")]
    Security(String),

    /// The overlay has not been initialized.
    #[error("overlay {0} is not initialized")]
    NotInitialized(String),

    /// The overlay is not ACTIVE.
    #[error("overlay {overlay} is {state}, not ACTIVE")]
    NotActive {
        /// Overlay name.
        overlay: String,
        /// Current state.
        state: OverlayState,
    },

    /// Overlay or instance unknown.
    #[error("overlay not found: {0}")]
    NotFound(String),

    /// The execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// `initialize` failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// The overlay panicked.
    #[error("overlay {0} panicked")]
    Panicked(String),

    /// The overlay reported a failure.
    #[error("execution failed: {0}")]
    Execution(String),
}

impl OverlayError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCapabilities { .. } => ErrorKind::Capability,
            Self::Timeout { .. } | Self::FuelExhausted { .. } | Self::MemoryLimitExceeded { .. } => {
                ErrorKind::ResourceLimit
            }
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::InsufficientTrust { .. } | Self::Security(_) => ErrorKind::Security,
            Self::NotInitialized(_) | Self::NotActive { .. } => ErrorKind::InvalidState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InitializationFailed(_) | Self::Panicked(_) | Self::Execution(_) => {
                ErrorKind::Execution
            }
        }
    }

    /// Convenience constructor for overlay business failures.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

fn format_capabilities(capabilities: &[Capability]) -> String {
    capabilities
        .iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
