//! # Error Types
//!
//! Errors from registry operations. Execution failures are never errors; they
//! come back as non-success [`OverlayExecutionResult`](crate::OverlayExecutionResult)s.

use kg_01_overlay_contract::OverlayError;
use shared_bus::SubscriptionError;
use thiserror::Error;

/// Errors from overlay registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// No instance with this id.
    #[error("overlay instance not found: {0}")]
    NotFound(String),

    /// `initialize` failed, so the overlay was not registered.
    #[error("overlay {overlay} failed to initialize: {source}")]
    Initialization {
        /// Overlay name.
        overlay: String,
        /// Underlying failure.
        source: OverlayError,
    },

    /// Lifecycle transition not allowed from the current state.
    #[error("invalid lifecycle transition: {0}")]
    InvalidState(#[from] OverlayError),

    /// Subscribing to the event bus failed.
    #[error("event bus subscription failed: {0}")]
    Subscription(#[from] SubscriptionError),
}
