//! # Overlay Manifest
//!
//! What an overlay declares about itself before it is ever run.

use serde::{Deserialize, Serialize};
use shared_bus::EventType;
use shared_types::{Capability, CapabilitySet, FuelBudget, TrustLevel};
use std::collections::BTreeSet;

/// Static declaration of an overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayManifest {
    /// Stable name; the registry indexes instances by it.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Human-readable summary.
    pub description: String,
    /// Event types routed to this overlay.
    pub subscribed_events: BTreeSet<EventType>,
    /// Capabilities every execution must be granted.
    pub required_capabilities: CapabilitySet,
    /// Budget used when a request supplies none.
    pub default_fuel: FuelBudget,
    /// Lowest caller trust accepted.
    pub min_trust: TrustLevel,
}

impl OverlayManifest {
    /// Manifest with no subscriptions, no capabilities and default limits.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            subscribed_events: BTreeSet::new(),
            required_capabilities: CapabilitySet::empty(),
            default_fuel: FuelBudget::default(),
            min_trust: TrustLevel::Sandbox,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn subscribes_to(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.subscribed_events.extend(events);
        self
    }

    #[must_use]
    pub fn requires(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        for capability in capabilities {
            self.required_capabilities.insert(capability);
        }
        self
    }

    #[must_use]
    pub fn with_fuel(mut self, budget: FuelBudget) -> Self {
        self.default_fuel = budget;
        self
    }

    #[must_use]
    pub fn with_min_trust(mut self, level: TrustLevel) -> Self {
        self.min_trust = level;
        self
    }

    /// Returns true if this overlay should be routed `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: EventType) -> bool {
        self.subscribed_events.contains(&event_type)
    }
}
