//! # Core Kernel Entities
//!
//! ## Clusters
//!
//! - **Permissions**: [`Capability`], [`CapabilitySet`], [`TrustLevel`]
//! - **Lifecycle**: [`OverlayState`]
//! - **Data**: [`Payload`] and the id helpers

use crate::errors::TypeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Free-form structured data carried by events, overlay inputs and outputs.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Generate a fresh random identifier.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// CLUSTER A: PERMISSIONS
// =============================================================================

/// A named permission gating one family of host operations.
///
/// The set is closed: adding a capability is a breaking change on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Outbound network requests.
    NetworkAccess,
    /// Graph database reads.
    DatabaseRead,
    /// Graph database writes.
    DatabaseWrite,
    /// Publishing events to the bus.
    EventPublish,
    /// Subscribing to bus events.
    EventSubscribe,
    /// Creating capsules.
    CapsuleCreate,
    /// Reading capsules.
    CapsuleRead,
    /// Modifying capsules.
    CapsuleModify,
    /// Deleting capsules.
    CapsuleDelete,
    /// Casting governance votes.
    GovernanceVote,
    /// Calling a language model.
    LlmAccess,
    /// Reading files.
    FileRead,
    /// Writing files.
    FileWrite,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 13] = [
        Capability::NetworkAccess,
        Capability::DatabaseRead,
        Capability::DatabaseWrite,
        Capability::EventPublish,
        Capability::EventSubscribe,
        Capability::CapsuleCreate,
        Capability::CapsuleRead,
        Capability::CapsuleModify,
        Capability::CapsuleDelete,
        Capability::GovernanceVote,
        Capability::LlmAccess,
        Capability::FileRead,
        Capability::FileWrite,
    ];

    /// Stable wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkAccess => "network_access",
            Self::DatabaseRead => "database_read",
            Self::DatabaseWrite => "database_write",
            Self::EventPublish => "event_publish",
            Self::EventSubscribe => "event_subscribe",
            Self::CapsuleCreate => "capsule_create",
            Self::CapsuleRead => "capsule_read",
            Self::CapsuleModify => "capsule_modify",
            Self::CapsuleDelete => "capsule_delete",
            Self::GovernanceVote => "governance_vote",
            Self::LlmAccess => "llm_access",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| TypeError::UnknownCapability(s.to_string()))
    }
}

/// An ordered set of capabilities.
///
/// Granting follows narrowing only: `effective = requested ∩ declared`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every capability.
    #[must_use]
    pub fn all() -> Self {
        Self(Capability::ALL.iter().copied().collect())
    }

    /// Returns true if `capability` is granted.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Add a capability.
    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    /// Remove a capability.
    pub fn remove(&mut self, capability: Capability) -> bool {
        self.0.remove(&capability)
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    /// Capabilities present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Returns true if every capability of `self` is also in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Capabilities of `self` that `granted` lacks.
    #[must_use]
    pub fn missing_from(&self, granted: &CapabilitySet) -> Vec<Capability> {
        self.0.difference(&granted.0).copied().collect()
    }

    /// Number of capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing is granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(caps: [Capability; N]) -> Self {
        caps.into_iter().collect()
    }
}

/// How much the kernel trusts the party behind an execution.
///
/// Ordered from least to most trusted, so `>=` comparisons express
/// "at least this trusted".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Isolated after misbehaviour.
    Quarantine,
    /// Unknown party.
    Sandbox,
    /// Ordinary authenticated party.
    #[default]
    Standard,
    /// Vetted party.
    Trusted,
    /// Kernel-internal code.
    Core,
}

impl TrustLevel {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quarantine => "quarantine",
            Self::Sandbox => "sandbox",
            Self::Standard => "standard",
            Self::Trusted => "trusted",
            Self::Core => "core",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quarantine" => Ok(Self::Quarantine),
            "sandbox" => Ok(Self::Sandbox),
            "standard" => Ok(Self::Standard),
            "trusted" => Ok(Self::Trusted),
            "core" => Ok(Self::Core),
            other => Err(TypeError::UnknownTrustLevel(other.to_string())),
        }
    }
}

// =============================================================================
// CLUSTER B: LIFECYCLE
// =============================================================================

/// Lifecycle state of a registered overlay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayState {
    /// Known to the registry, not yet initialized.
    #[default]
    Registered,
    /// `initialize` in progress.
    Initializing,
    /// Accepting executions.
    Active,
    /// Initialized but switched off by an operator.
    Inactive,
    /// Initialization or a fatal execution failed.
    Error,
    /// Cleaned up; terminal.
    Stopped,
}

impl OverlayState {
    /// Returns true if executions are accepted in this state.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for OverlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
