//! Security modes, execution states and runtime configuration.

use serde::{Deserialize, Serialize};
use shared_types::Capability;
use std::fmt;
use std::time::Duration;

// =============================================================================
// SECURITY MODE
// =============================================================================

/// Isolation level an instance is loaded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Full isolation; capabilities reaching outside the kernel are refused.
    Strict,
    /// Full isolation.
    #[default]
    Standard,
    /// In-process bypass. Only for attested, internally trusted code.
    Trusted,
}

impl SecurityMode {
    /// Returns true if the mode skips sandbox isolation.
    #[must_use]
    pub fn bypasses_isolation(&self) -> bool {
        matches!(self, Self::Trusted)
    }

    /// Returns true if `capability` may be declared under this mode.
    #[must_use]
    pub fn permits(&self, capability: Capability) -> bool {
        match self {
            Self::Strict => !matches!(
                capability,
                Capability::NetworkAccess
                    | Capability::LlmAccess
                    | Capability::FileRead
                    | Capability::FileWrite
            ),
            Self::Standard | Self::Trusted => true,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Standard => "standard",
            Self::Trusted => "trusted",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// EXECUTION STATE
// =============================================================================

/// Lifecycle of a sandbox instance.
///
/// ```text
/// Initializing ──► Ready ◄──► Running ──► Failed
///                   │  ▲
///                   ▼  │
///                  Paused         (any) ──► Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Initializing,
    Ready,
    Running,
    Paused,
    Terminated,
    Failed,
}

impl ExecutionState {
    /// Returns true if `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Initializing, Ready | Failed) => true,
            (Ready, Running | Paused) => true,
            (Running, Ready | Failed) => true,
            (Paused, Ready) => true,
            // reload
            (Ready | Paused | Failed, Initializing) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Runtime-wide defaults and metering rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Fuel granted to a freshly loaded instance.
    pub default_fuel: u64,
    /// Memory ceiling of a freshly loaded instance.
    pub default_memory_mb: u64,
    /// Deadline of one call.
    pub default_timeout: Duration,
    /// Fuel charged per millisecond of wall time.
    pub fuel_per_ms: u64,
    /// Fuel charged per host-function call.
    pub host_call_cost: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_fuel: 1_000_000,
            default_memory_mb: 256,
            default_timeout: Duration::from_secs(30),
            fuel_per_ms: 100,
            host_call_cost: 10,
        }
    }
}
