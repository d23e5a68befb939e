//! # Error Types
//!
//! Load-time, call-time and host-function errors of the sandbox runtime.

use crate::domain::{ExecutionState, HostFunction, SecurityMode};
use shared_types::Capability;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// RUNTIME ERRORS
// =============================================================================

/// Errors returned by [`SandboxRuntime`](crate::SandboxRuntime).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Invalid security mode / attestation combination. Raised at load only.
    #[error("security violation: {0}")]
    Security(String),

    /// A capability the security mode does not allow.
    #[error("capability {capability} not permitted in {mode} mode")]
    CapabilityNotPermitted {
        capability: Capability,
        mode: SecurityMode,
    },

    /// Malformed manifest.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// No loaded instance has this id.
    #[error("sandbox instance not found: {0}")]
    InstanceNotFound(String),

    /// Operation not legal in the instance's current state.
    #[error("instance {instance} is {state}, cannot {operation}")]
    InvalidState {
        instance: String,
        state: ExecutionState,
        operation: &'static str,
    },

    /// Function not exported by the manifest.
    #[error("function not exported: {0}")]
    UnknownFunction(String),

    /// Not enough fuel for the call, or fuel ran out during it.
    #[error("fuel exhausted: required {required}, remaining {remaining}")]
    FuelExhausted { required: u64, remaining: u64 },

    /// Serialized payload larger than the memory ceiling.
    #[error("memory limit exceeded: {size} > {limit} bytes")]
    MemoryLimitExceeded { size: u64, limit: u64 },

    /// Call exceeded its deadline.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled by its caller or by `terminate`.
    #[error("execution cancelled")]
    Cancelled,

    /// Instance code failed.
    #[error("trap: {0}")]
    Trap(String),

    /// Instance code panicked.
    #[error("instance code panicked")]
    Panicked,

    /// Payload could not be serialized for the memory check.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl SandboxError {
    /// Returns true for errors that move the instance to FAILED.
    #[must_use]
    pub fn fails_instance(&self) -> bool {
        matches!(
            self,
            Self::FuelExhausted { .. }
                | Self::MemoryLimitExceeded { .. }
                | Self::Timeout(_)
                | Self::Cancelled
                | Self::Trap(_)
                | Self::Panicked
        )
    }
}

// =============================================================================
// HOST-FUNCTION ERRORS
// =============================================================================

/// Errors seen by instance code when it calls a host function.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Not in this instance's binding table.
    #[error("host function not bound: {0}")]
    NotBound(HostFunction),

    /// Host calls used up the call's fuel allowance.
    #[error("out of fuel after {calls} host calls")]
    OutOfFuel { calls: u64 },

    /// Arguments missing or of the wrong shape.
    #[error("invalid arguments for {function}: {reason}")]
    InvalidArguments {
        function: HostFunction,
        reason: String,
    },

    /// The backing port failed.
    #[error("host backend error: {0}")]
    Backend(String),
}

impl From<QueryError> for HostError {
    fn from(err: QueryError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors from the storage port.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Failed(String),

    #[error("storage unavailable")]
    Unavailable,
}
