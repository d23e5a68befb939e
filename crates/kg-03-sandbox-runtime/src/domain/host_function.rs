//! # Host Functions
//!
//! The closed set of functions the host exposes to instance code. Each is
//! gated by at most one capability; an instance's binding table only ever
//! contains the functions its declared capabilities unlock.

use serde::{Deserialize, Serialize};
use shared_types::{Capability, CapabilitySet};
use std::fmt;

/// A function instance code may import from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFunction {
    // Ungated
    Log,
    Now,

    // Storage
    DbQuery,
    DbQuerySingle,
    DbWrite,

    // Event bus
    PublishEvent,
    SubscribeEvent,

    // Capsules
    CapsuleCreate,
    CapsuleRead,
    CapsuleUpdate,
    CapsuleDelete,

    // Governance
    CastVote,

    // Outside world
    HttpRequest,
    LlmComplete,
    FileRead,
    FileWrite,
}

impl HostFunction {
    pub const ALL: [HostFunction; 16] = [
        HostFunction::Log,
        HostFunction::Now,
        HostFunction::DbQuery,
        HostFunction::DbQuerySingle,
        HostFunction::DbWrite,
        HostFunction::PublishEvent,
        HostFunction::SubscribeEvent,
        HostFunction::CapsuleCreate,
        HostFunction::CapsuleRead,
        HostFunction::CapsuleUpdate,
        HostFunction::CapsuleDelete,
        HostFunction::CastVote,
        HostFunction::HttpRequest,
        HostFunction::LlmComplete,
        HostFunction::FileRead,
        HostFunction::FileWrite,
    ];

    /// The capability that unlocks this function, if any.
    #[must_use]
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            Self::Log | Self::Now => None,
            Self::DbQuery | Self::DbQuerySingle => Some(Capability::DatabaseRead),
            Self::DbWrite => Some(Capability::DatabaseWrite),
            Self::PublishEvent => Some(Capability::EventPublish),
            Self::SubscribeEvent => Some(Capability::EventSubscribe),
            Self::CapsuleCreate => Some(Capability::CapsuleCreate),
            Self::CapsuleRead => Some(Capability::CapsuleRead),
            Self::CapsuleUpdate => Some(Capability::CapsuleModify),
            Self::CapsuleDelete => Some(Capability::CapsuleDelete),
            Self::CastVote => Some(Capability::GovernanceVote),
            Self::HttpRequest => Some(Capability::NetworkAccess),
            Self::LlmComplete => Some(Capability::LlmAccess),
            Self::FileRead => Some(Capability::FileRead),
            Self::FileWrite => Some(Capability::FileWrite),
        }
    }

    /// Returns true if `granted` unlocks this function.
    #[must_use]
    pub fn is_unlocked_by(&self, granted: &CapabilitySet) -> bool {
        self.required_capability()
            .map_or(true, |capability| granted.contains(capability))
    }

    /// Every function gated by `capability`.
    pub fn gated_by(capability: Capability) -> impl Iterator<Item = HostFunction> {
        Self::ALL
            .into_iter()
            .filter(move |f| f.required_capability() == Some(capability))
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Now => "now",
            Self::DbQuery => "db_query",
            Self::DbQuerySingle => "db_query_single",
            Self::DbWrite => "db_write",
            Self::PublishEvent => "publish_event",
            Self::SubscribeEvent => "subscribe_event",
            Self::CapsuleCreate => "capsule_create",
            Self::CapsuleRead => "capsule_read",
            Self::CapsuleUpdate => "capsule_update",
            Self::CapsuleDelete => "capsule_delete",
            Self::CastVote => "cast_vote",
            Self::HttpRequest => "http_request",
            Self::LlmComplete => "llm_complete",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
        }
    }
}

impl fmt::Display for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
