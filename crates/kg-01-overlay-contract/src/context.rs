//! # Execution Context
//!
//! Everything an overlay may know about the invocation it is serving.

use crate::errors::OverlayError;
use serde_json::Value;
use shared_types::{new_id, Capability, CapabilitySet, FuelBudget, Payload, TrustLevel};
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to [`Overlay::execute`](crate::Overlay::execute).
///
/// `capabilities` is already narrowed to `requested ∩ declared` by whoever
/// built the context. The cancellation token is a child of the caller's, so
/// cancelling a pipeline reaches every overlay it is running.
#[derive(Debug, Clone)]
pub struct OverlayContext {
    /// Unique id of this invocation.
    pub execution_id: String,
    /// Instance being executed.
    pub overlay_id: String,
    /// Name of the overlay being executed.
    pub overlay_name: String,
    /// Ties this invocation to the request that caused it.
    pub correlation_id: Option<String>,
    /// Who triggered the invocation, e.g. an event source or `pipeline`.
    pub triggered_by: Option<String>,
    /// End user on whose behalf the work runs.
    pub user_id: Option<String>,
    /// Caller trust.
    pub trust_level: TrustLevel,
    /// Effective capability grant.
    pub capabilities: CapabilitySet,
    /// Resource quota for this invocation.
    pub fuel_budget: FuelBudget,
    /// Free-form extras.
    pub metadata: Payload,
    /// Cooperative cancellation.
    pub cancellation: CancellationToken,
}

impl OverlayContext {
    /// Context with a fresh execution id and a standalone cancellation token.
    pub fn new(
        overlay_id: impl Into<String>,
        overlay_name: impl Into<String>,
        trust_level: TrustLevel,
        capabilities: CapabilitySet,
        fuel_budget: FuelBudget,
    ) -> Self {
        Self {
            execution_id: new_id(),
            overlay_id: overlay_id.into(),
            overlay_name: overlay_name.into(),
            correlation_id: None,
            triggered_by: None,
            user_id: None,
            trust_level,
            capabilities,
            fuel_budget,
            metadata: Payload::new(),
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, triggered_by: Option<String>) -> Self {
        self.triggered_by = triggered_by;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if `capability` was granted.
    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Fail closed unless `capability` was granted.
    pub fn require_capability(&self, capability: Capability) -> Result<(), OverlayError> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(OverlayError::MissingCapabilities {
                overlay: self.overlay_name.clone(),
                missing: vec![capability],
            })
        }
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
