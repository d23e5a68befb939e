//! # Overlay Trait
//!
//! The interface every overlay implements. Callers never invoke `execute`
//! directly; they go through [`OverlayInstance::run`](crate::OverlayInstance::run),
//! which enforces lifecycle, capabilities, deadlines and panic isolation.

use crate::context::OverlayContext;
use crate::errors::OverlayError;
use crate::manifest::OverlayManifest;
use crate::result::OverlayResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_bus::Event;
use shared_types::Payload;

/// Health as reported by the overlay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub message: Option<String>,
    pub details: Payload,
}

impl HealthReport {
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            details: Payload::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            details: Payload::new(),
        }
    }
}

/// A pluggable processing unit.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Static declaration.
    fn manifest(&self) -> &OverlayManifest;

    /// One-time setup. Must be idempotent. An error fails registration.
    async fn initialize(&self) -> Result<(), OverlayError> {
        Ok(())
    }

    /// The actual work. Triggered either by `event` or by direct invocation
    /// with `input`.
    async fn execute(
        &self,
        ctx: &OverlayContext,
        event: Option<&Event>,
        input: &Payload,
    ) -> Result<OverlayResult, OverlayError>;

    /// Best-effort teardown.
    async fn cleanup(&self) {}

    /// Must be cheap and callable in any state.
    async fn health_check(&self) -> HealthReport {
        HealthReport::healthy()
    }
}
